use crate::packet::PacketMeta;
use fluxpath_core::umem::{FrameAllocator, UmemRegion};
use std::sync::Arc;

/// One buffer of a packet. `addr` is the frame start, data begins at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frag {
    pub addr: u64,
    pub offset: u32,
    pub len: u32,
}

impl Frag {
    #[inline]
    pub fn data_addr(&self) -> u64 {
        self.addr + self.offset as u64
    }
}

/// An owned frame: one or more buffers in the UMEM region plus metadata.
///
/// Dropping the packet hands its buffers back to the general allocator,
/// from whatever thread that happens on.
pub struct Packet {
    frags: Vec<Frag>,
    umem: Arc<UmemRegion>,
    frames: Arc<FrameAllocator>,
    pub meta: PacketMeta,
}

unsafe impl Send for Packet {}
unsafe impl Sync for Packet {}

impl Packet {
    pub(crate) fn new(umem: Arc<UmemRegion>, frames: Arc<FrameAllocator>) -> Self {
        Self {
            frags: Vec::with_capacity(1),
            umem,
            frames,
            meta: PacketMeta::default(),
        }
    }

    /// Copies `data` into freshly allocated frames.
    pub fn from_bytes(
        umem: Arc<UmemRegion>,
        frames: Arc<FrameAllocator>,
        data: &[u8],
    ) -> Option<Self> {
        let frame_size = umem.layout().frame_size as usize;
        let mut packet = Self::new(umem, frames);
        for chunk in data.chunks(frame_size) {
            let addr = packet.frames.allocate()?;
            unsafe {
                if packet.umem.write(addr, chunk).is_err() {
                    packet.frames.release(addr);
                    return None;
                }
            }
            packet.push_frag(Frag {
                addr,
                offset: 0,
                len: chunk.len() as u32,
            });
        }
        Some(packet)
    }

    pub(crate) fn push_frag(&mut self, frag: Frag) {
        self.frags.push(frag);
    }

    /// Detaches the frames so dropping the packet does not free them.
    pub(crate) fn take_frames(&mut self) -> Vec<u64> {
        self.frags.drain(..).map(|f| f.addr).collect()
    }

    pub fn frags(&self) -> &[Frag] {
        &self.frags
    }

    pub fn num_frags(&self) -> usize {
        self.frags.len()
    }

    pub fn len(&self) -> usize {
        self.frags.iter().map(|f| f.len as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn frag_data(&self, idx: usize) -> &[u8] {
        self.frags
            .get(idx)
            .and_then(|f| self.umem.slice(f.data_addr(), f.len as usize))
            .unwrap_or(&[])
    }

    /// Bytes of the first buffer, enough for header inspection.
    pub fn data(&self) -> &[u8] {
        self.frag_data(0)
    }

    /// Linearised copy of the whole packet.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for i in 0..self.frags.len() {
            out.extend_from_slice(self.frag_data(i));
        }
        out
    }

    /// Deep copy into new frames. `None` when the allocator is dry.
    pub fn try_clone(&self) -> Option<Packet> {
        let mut copy = Packet::new(self.umem.clone(), self.frames.clone());
        copy.meta = self.meta.clone();
        for (i, frag) in self.frags.iter().enumerate() {
            let addr = self.frames.allocate()?;
            let src = self.frag_data(i);
            unsafe {
                if self.umem.write(addr + frag.offset as u64, src).is_err() {
                    self.frames.release(addr);
                    return None;
                }
            }
            copy.push_frag(Frag { addr, ..*frag });
        }
        Some(copy)
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        for frag in self.frags.drain(..) {
            self.frames.release(frag.addr);
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("frags", &self.frags)
            .field("meta", &self.meta)
            .finish()
    }
}
