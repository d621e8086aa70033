pub mod owned;

pub use owned::{Frag, Packet};

use crate::peer::{PeerId, VdevId, INVALID_PEER};

/// Per-packet metadata filled in by the RX path (and by senders for TX).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMeta {
    pub peer_id: PeerId,
    pub vdev_id: VdevId,
    pub tid: u8,
    pub ring_id: u8,
    pub chip_id: u8,
    pub first_msdu: bool,
    pub last_msdu: bool,
    pub da_valid: bool,
    pub sa_valid: bool,
    pub da_is_mcbc: bool,
    pub intra_bss: bool,
    pub da_peer: PeerId,
    pub dest_chip: u8,
    pub retry: bool,
    pub raw: bool,
    /// Frame was reassembled from several buffers.
    pub sg: bool,
}

impl Default for PacketMeta {
    fn default() -> Self {
        Self {
            peer_id: INVALID_PEER,
            vdev_id: 0,
            tid: 0,
            ring_id: 0,
            chip_id: 0,
            first_msdu: false,
            last_msdu: false,
            da_valid: false,
            sa_valid: false,
            da_is_mcbc: false,
            intra_bss: false,
            da_peer: INVALID_PEER,
            dest_chip: 0,
            retry: false,
            raw: false,
            sg: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxpath_core::umem::{FrameAllocator, UmemLayout, UmemRegion};
    use std::sync::Arc;

    fn region() -> (Arc<UmemRegion>, Arc<FrameAllocator>) {
        let layout = UmemLayout::new(2048, 8).unwrap();
        (
            Arc::new(UmemRegion::new(layout).unwrap()),
            Arc::new(FrameAllocator::new(layout)),
        )
    }

    #[test]
    fn test_packet_spans_frames_and_recycles() {
        let (umem, frames) = region();
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();

        // 1. 3000 bytes need two 2048-byte frames
        let packet = Packet::from_bytes(umem, frames.clone(), &data).unwrap();
        assert_eq!(packet.num_frags(), 2);
        assert_eq!(packet.len(), 3000);
        assert_eq!(packet.to_vec(), data);
        assert_eq!(frames.available(), 6);

        // 2. Drop returns both frames
        drop(packet);
        assert_eq!(frames.available(), 8);
    }

    #[test]
    fn test_try_clone_is_deep() {
        let (umem, frames) = region();
        let mut packet = Packet::from_bytes(umem, frames.clone(), &[1, 2, 3]).unwrap();
        packet.meta.peer_id = 4;

        let copy = packet.try_clone().unwrap();
        assert_ne!(copy.frags()[0].addr, packet.frags()[0].addr);
        assert_eq!(copy.data(), &[1, 2, 3]);
        assert_eq!(copy.meta.peer_id, 4);
        assert_eq!(frames.available(), 6);
    }

    #[test]
    fn test_clone_fails_when_dry() {
        let (umem, frames) = region();
        let packet = Packet::from_bytes(umem, frames.clone(), &[9; 10]).unwrap();
        while frames.allocate().is_some() {}
        assert!(packet.try_clone().is_none());
    }
}
