//! In-process device model.
//!
//! Plays the hardware side of every ring: takes buffers off the refill rings,
//! writes received frames into them, drains the TX rings and posts
//! completions.

use crate::builder::DeviceRings;
use crate::config::CookieMode;
use crate::context::Datapath;
use crate::peer::{PeerId, VdevId, INVALID_PEER};
use crate::tx::status::{fw_status, TqmReason};
use fluxpath_core::ring::entry::{msdu, mpdu, release_src, tx};
use fluxpath_core::ring::{RxEntry, TxCompEntry, TxEntry};
use fluxpath_core::rx_tlv::{RxTlv, RX_TLV_SIZE};
use std::sync::Arc;

/// How the device describes a received frame.
#[derive(Debug, Clone)]
pub struct RxInfo {
    pub peer: PeerId,
    pub vdev: VdevId,
    pub tid: u8,
    /// Buffer pool the frame lands in.
    pub chip: u8,
    pub pool: u8,
    pub mcbc: bool,
    pub da_peer: Option<PeerId>,
    pub dest_chip: u8,
    pub intra_bss: bool,
    pub raw: bool,
    pub msdu_done: bool,
    pub l3_pad: u8,
}

impl Default for RxInfo {
    fn default() -> Self {
        Self {
            peer: 0,
            vdev: 0,
            tid: 0,
            chip: 0,
            pool: 0,
            mcbc: false,
            da_peer: None,
            dest_chip: 0,
            intra_bss: false,
            raw: false,
            msdu_done: true,
            l3_pad: 0,
        }
    }
}

/// A frame the device pulled off a TX ring.
#[derive(Debug, Clone)]
pub struct TxFrame {
    pub entry: TxEntry,
    pub data: Vec<u8>,
}

/// Completion status the device reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompStatus {
    Acked,
    Tqm(TqmReason),
    /// Firmware status code.
    Fw(u8),
    /// Firmware reinject with the given reason.
    Reinject(u8),
    /// Raw release source with a zero status.
    Source(u8),
}

pub struct Simulator {
    dp: Arc<Datapath>,
    rings: DeviceRings,
    /// RX entries written to buffers but not yet posted, per ring.
    held: Vec<(usize, RxEntry)>,
}

impl Simulator {
    pub fn new(dp: Arc<Datapath>, rings: DeviceRings) -> Self {
        Self {
            dp,
            rings,
            held: Vec::new(),
        }
    }

    pub fn datapath(&self) -> &Arc<Datapath> {
        &self.dp
    }

    /// Buffers posted on a refill ring and not taken yet.
    pub fn refill_pending(&self, chip: u8, pool: u8) -> u32 {
        self.rings
            .refill
            .get(chip as usize)
            .and_then(|c| c.get(pool as usize))
            .map(|r| r.pending())
            .unwrap_or(0)
    }

    pub fn set_rx_ring_error(&self, ring: usize, on: bool) {
        if let Some(mem) = self.rings.rx_mem.get(ring) {
            mem.set_error(on);
        }
    }

    pub fn set_comp_ring_error(&self, ring: usize, on: bool) {
        if let Some(mem) = self.rings.comp_mem.get(ring) {
            mem.set_error(on);
        }
    }

    /// Receives `frame` on RX ring `ring`. Returns the number of buffers used.
    pub fn inject(&mut self, ring: usize, frame: &[u8], info: &RxInfo) -> Result<usize, String> {
        self.inject_split(ring, frame, info, usize::MAX)
    }

    /// Like [`inject`](Self::inject) but only the first `post` buffers show
    /// up on the ring; the rest wait for [`post_held`](Self::post_held).
    pub fn inject_split(
        &mut self,
        ring: usize,
        frame: &[u8],
        info: &RxInfo,
        post: usize,
    ) -> Result<usize, String> {
        let room = (self.dp.cfg.frame_size as usize) - RX_TLV_SIZE;
        let first_room = room.saturating_sub(info.l3_pad as usize);
        let nbufs = if frame.len() <= first_room {
            1
        } else {
            1 + (frame.len() - first_room).div_ceil(room)
        };
        if frame.len() > u16::MAX as usize {
            return Err(format!("frame of {} bytes too long", frame.len()));
        }

        let rx = self.rings.rx.get_mut(ring).ok_or("no such RX ring")?;
        if rx.num_free() < nbufs as u32 {
            return Err("RX ring full".to_string());
        }
        let refill = self
            .rings
            .refill
            .get_mut(info.chip as usize)
            .and_then(|c| c.get_mut(info.pool as usize))
            .ok_or("no such buffer pool")?;

        // 1. Take buffers the host posted
        refill.access_start().map_err(|e| e.to_string())?;
        if refill.num_valid() < nbufs as u32 {
            refill.access_end();
            return Err("RX dropped: no buffers on the refill ring".to_string());
        }
        let mut bufs = Vec::with_capacity(nbufs);
        for _ in 0..nbufs {
            if let Some(entry) = refill.next() {
                bufs.push(entry);
            }
        }
        refill.access_end();

        // 2. Fill them and describe them on the RX ring
        let tlv = RxTlv {
            msdu_done: info.msdu_done,
            da_valid: info.da_peer.is_some(),
            sa_valid: true,
            da_is_mcbc: info.mcbc,
            intra_bss: info.intra_bss,
            l3_pad: info.l3_pad,
            dest_chip: info.dest_chip,
            da_peer: info.da_peer.unwrap_or(INVALID_PEER),
        };
        let mut header = [0u8; RX_TLV_SIZE];
        tlv.write(&mut header);

        let mut flags = msdu::FIRST_MSDU_IN_MPDU | msdu::LAST_MSDU_IN_MPDU | msdu::SA_IS_VALID;
        if info.da_peer.is_some() {
            flags |= msdu::DA_IS_VALID;
        }
        if info.mcbc {
            flags |= msdu::DA_IS_MCBC;
        }

        rx.access_start().map_err(|e| e.to_string())?;
        let mut offset = 0;
        for (i, buf) in bufs.iter().enumerate() {
            let addr = self
                .dp
                .dma
                .host_addr(buf.buf_dma)
                .ok_or("buffer address not translatable")?;
            let (data_off, cap) = if i == 0 {
                (RX_TLV_SIZE + info.l3_pad as usize, first_room)
            } else {
                (RX_TLV_SIZE, room)
            };
            let end = (offset + cap).min(frame.len());
            unsafe {
                self.dp.umem.write(addr, &header).map_err(|e| e.to_string())?;
                self.dp
                    .umem
                    .write(addr + data_off as u64, &frame[offset..end])
                    .map_err(|e| e.to_string())?;
            }
            offset = end;

            let last = i + 1 == nbufs;
            let entry = RxEntry {
                cookie: buf.cookie,
                buf_dma: buf.buf_dma,
                msdu_len: frame.len() as u16,
                msdu_flags: if last { flags } else { flags | msdu::CONTINUATION },
                mpdu_flags: if info.raw { mpdu::RAW } else { 0 },
                peer_id: info.peer,
                tid: info.tid,
                chip_id: buf.chip_id,
                vdev_id: info.vdev,
                ..Default::default()
            };
            if i < post {
                rx.push(entry).map_err(|e| e.to_string())?;
            } else {
                self.held.push((ring, entry));
            }
        }
        rx.access_end();
        Ok(nbufs)
    }

    /// Posts every entry `inject_split` held back.
    pub fn post_held(&mut self) -> Result<usize, String> {
        let held = std::mem::take(&mut self.held);
        let n = held.len();
        for (ring, entry) in held {
            self.inject_entry(ring, entry)?;
        }
        Ok(n)
    }

    /// Hands back the entries `inject_split` held, without posting them.
    pub fn take_held(&mut self) -> Vec<(usize, RxEntry)> {
        std::mem::take(&mut self.held)
    }

    /// Posts a hand-made entry on an RX ring.
    pub fn inject_entry(&mut self, ring: usize, entry: RxEntry) -> Result<(), String> {
        let rx = self.rings.rx.get_mut(ring).ok_or("no such RX ring")?;
        rx.access_start().map_err(|e| e.to_string())?;
        rx.push(entry).map_err(|e| e.to_string())?;
        rx.access_end();
        Ok(())
    }

    /// Pulls up to `max` submitted frames off TX ring `ring`.
    pub fn transmit(&mut self, ring: usize, max: usize) -> Vec<TxFrame> {
        let Some(txr) = self.rings.tx.get_mut(ring) else {
            return Vec::new();
        };
        if txr.access_start().is_err() {
            return Vec::new();
        }
        let mut out = Vec::new();
        while out.len() < max {
            let Some(entry) = txr.next() else {
                break;
            };
            let frags = if entry.flags & tx::EXT_DESC != 0 {
                self.dp.ext_frags(entry.ext_cookie).unwrap_or_default()
            } else {
                vec![(entry.buf_dma, entry.len)]
            };
            let mut data = Vec::with_capacity(entry.len as usize);
            for (dma, len) in frags {
                let bytes = self
                    .dp
                    .dma
                    .host_addr(dma)
                    .and_then(|addr| self.dp.umem.slice(addr, len as usize));
                if let Some(bytes) = bytes {
                    data.extend_from_slice(bytes);
                }
            }
            out.push(TxFrame { entry, data });
        }
        txr.access_end();
        out
    }

    /// Reports the fate of `frame` on completion ring `ring`.
    pub fn complete(&mut self, ring: usize, frame: &TxFrame, status: CompStatus) -> Result<(), String> {
        let (src, code, reason) = match status {
            CompStatus::Acked => (release_src::TQM, TqmReason::Acked as u8, 0),
            CompStatus::Tqm(r) => (release_src::TQM, r as u8, 0),
            CompStatus::Fw(code) => (release_src::FW, code, 0),
            CompStatus::Reinject(reason) => (release_src::FW, fw_status::REINJECT, reason),
            CompStatus::Source(src) => (src, 0, 0),
        };
        let mut entry = TxCompEntry {
            cookie: frame.entry.cookie,
            release_src: src,
            status: code,
            reinject_reason: reason,
            buf_dma: frame.entry.buf_dma,
            peer_id: frame.entry.peer_id,
            tid: frame.entry.tid,
            ..Default::default()
        };
        if self.dp.cfg.cookie_mode == CookieMode::Hardware {
            let handle = self
                .dp
                .tx_desc_handle(frame.entry.cookie)
                .ok_or("cookie does not name a TX descriptor")?;
            entry.cc_done = 1;
            entry.desc_va = handle as u64;
        }
        self.complete_entry(ring, entry)
    }

    /// Posts a hand-made completion entry.
    pub fn complete_entry(&mut self, ring: usize, entry: TxCompEntry) -> Result<(), String> {
        let comp = self.rings.comp.get_mut(ring).ok_or("no such completion ring")?;
        comp.access_start().map_err(|e| e.to_string())?;
        comp.push(entry).map_err(|e| e.to_string())?;
        comp.access_end();
        Ok(())
    }
}
