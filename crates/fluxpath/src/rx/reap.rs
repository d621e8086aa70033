//! RX reap engine.
//!
//! A pass runs in three steps:
//! 1. walk the ring, validate every entry and resolve its descriptor
//! 2. free the descriptors and post the same number of fresh buffers per pool
//! 3. rebuild MSDUs from the buffers, apply policy and hand them out in
//!    per-peer batches

use crate::context::{lock, Datapath};
use crate::error::FluxError;
use crate::forward;
use crate::packet::{Frag, Packet, PacketMeta};
use crate::rx::deliver::{Batcher, Delivery};
use crate::rx::RxBuf;
use crate::stats::{add, bump, bump_ratelimited};
use fluxpath_core::ring::entry::{host, mpdu, msdu};
use fluxpath_core::ring::{DstRing, RxEntry};
use fluxpath_core::rx_tlv::{RxTlv, RX_TLV_SIZE};
use fluxpath_core::{Cookie, DescId, PoolKind};
use fluxpath_proto::classify;
use std::sync::Arc;

struct Reaped {
    entry: RxEntry,
    chip: u8,
    pool: u8,
    id: DescId,
    /// Member of an MSDU that lost one of its buffers.
    broken: bool,
}

/// MSDU whose last buffer has not been seen yet.
struct Partial {
    packet: Packet,
    remaining: u32,
    done: bool,
    /// A buffer arrived after the MSDU length was already covered.
    overrun: bool,
    bucket: (u8, u8),
}

pub struct RxReaper {
    dp: Arc<Datapath>,
    ring: DstRing<RxEntry>,
    ring_id: u8,
    prev_msdu_last: bool,
    /// The MSDU being walked lost a buffer.
    msdu_broken: bool,
    /// `partial` belongs to a broken MSDU that ended in the current pass.
    discard_partial: bool,
    partial: Option<Partial>,
}

impl RxReaper {
    pub fn new(dp: Arc<Datapath>, ring: DstRing<RxEntry>, ring_id: u8) -> Self {
        Self {
            dp,
            ring,
            ring_id,
            prev_msdu_last: true,
            msdu_broken: false,
            discard_partial: false,
            partial: None,
        }
    }

    pub fn ring_id(&self) -> u8 {
        self.ring_id
    }

    /// Reaps up to `quota` entries. A near-full ring earns a bounded number
    /// of extra passes beyond the quota.
    pub fn reap<D: Delivery>(&mut self, quota: u32, sink: &mut D) -> Result<usize, FluxError> {
        self.dp.check_halted()?;
        let quota = quota as usize;
        let mut total = 0;
        let mut extra = 0;
        loop {
            let budget = if total < quota { quota - total } else { quota };
            let n = self.pass(budget, sink)?;
            total += n;
            if n == 0 {
                break;
            }
            if self.ring.near_full() && extra < self.dp.cfg.near_full_passes {
                extra += 1;
                bump(&self.dp.stats.rx_near_full_passes);
                continue;
            }
            if total < quota && self.dp.cfg.end_of_loop_check && self.ring.pending() > 0 {
                continue;
            }
            break;
        }
        Ok(total)
    }

    fn pass<D: Delivery>(&mut self, budget: usize, sink: &mut D) -> Result<usize, FluxError> {
        let dp = self.dp.clone();
        if let Err(e) = self.ring.access_start() {
            if bump_ratelimited(&dp.stats.rx_ring_access_fail) {
                log::warn!("RX ring {}: {}", self.ring_id, e);
            }
            return Ok(0);
        }

        let reaped = match self.collect(&dp, budget) {
            Ok(reaped) => reaped,
            Err(e) => {
                self.ring.access_end();
                return Err(e);
            }
        };
        self.ring.access_end();
        add(&dp.stats.rx_reaped, reaped.len() as u64);

        let bufs = self.release_and_refill(&dp, &reaped)?;

        if std::mem::take(&mut self.discard_partial) {
            if let Some(mut partial) = self.partial.take() {
                recycle(&dp, partial.packet.take_frames(), partial.bucket);
            }
        }

        let mut batcher = Batcher::default();
        for (r, buf) in reaped.iter().zip(bufs) {
            if let Some(buf) = buf {
                self.rebuild(&dp, r, buf, &mut batcher, sink);
            }
        }
        batcher.flush(&dp, sink);

        log::trace!("RX ring {}: reaped {}", self.ring_id, reaped.len());
        Ok(reaped.len())
    }

    /// Walks the ring inside the access window.
    fn collect(&mut self, dp: &Datapath, budget: usize) -> Result<Vec<Reaped>, FluxError> {
        let limit = budget.min(dp.cfg.max_reap_limit as usize);
        let room = dp.cfg.frame_size - RX_TLV_SIZE as u32;
        let mut reaped: Vec<Reaped> = Vec::with_capacity(limit);
        // Index of the first buffer of the current MSDU; None if it started
        // in an earlier pass.
        let mut msdu_start = if self.prev_msdu_last { Some(0) } else { None };

        loop {
            // Never stop in the middle of a multi-buffer MSDU.
            if self.prev_msdu_last && reaped.len() >= limit {
                break;
            }
            let Some(mut entry) = self.ring.next() else {
                break;
            };
            let remaining = self.ring.num_valid() + 1;

            if entry.error != 0 {
                bump(&dp.stats.rx_ring_error);
                return Err(dp.halt(FluxError::Corruption(format!(
                    "RX ring {} reported error {}",
                    self.ring_id, entry.error
                ))));
            }
            if entry.is_reaped() {
                if bump_ratelimited(&dp.stats.rx_stale_cookie) {
                    log::warn!("RX ring {}: entry {:#x} seen twice", self.ring_id, entry.cookie);
                }
                if !self.prev_msdu_last {
                    self.msdu_broken = true;
                }
                continue;
            }

            let first = self.prev_msdu_last;
            if first {
                msdu_start = Some(reaped.len());
            }
            if first && entry.is_continuation() {
                let needed = entry.msdu_len as u32 / room + 1;
                if needed > remaining {
                    // Leave the whole MSDU for the next pass.
                    self.ring.dec_tail();
                    bump(&dp.stats.rx_sg_deferred);
                    break;
                }
            }

            entry.host_flags |= host::REAPED;
            self.ring.rewrite_last(entry);
            self.prev_msdu_last = !entry.is_continuation();

            match self.resolve(dp, &entry)? {
                Some((chip, pool, id)) => reaped.push(Reaped {
                    entry,
                    chip,
                    pool,
                    id,
                    broken: false,
                }),
                None if !(first && self.prev_msdu_last) => self.msdu_broken = true,
                None => {}
            }

            if self.prev_msdu_last && self.msdu_broken {
                self.msdu_broken = false;
                self.drop_msdu(dp, &mut reaped, msdu_start);
            }
        }
        Ok(reaped)
    }

    /// Marks every buffer of the MSDU that just ended as unusable.
    fn drop_msdu(&mut self, dp: &Datapath, reaped: &mut [Reaped], start: Option<usize>) {
        if bump_ratelimited(&dp.stats.rx_msdu_error) {
            log::warn!("RX ring {}: multi-buffer MSDU lost a buffer, dropped", self.ring_id);
        }
        let start = match start {
            Some(start) => start,
            None => {
                self.discard_partial = true;
                0
            }
        };
        for r in reaped.iter_mut().skip(start) {
            r.broken = true;
        }
    }

    fn resolve(&self, dp: &Datapath, entry: &RxEntry) -> Result<Option<(u8, u8, DescId)>, FluxError> {
        let cookie = Cookie::from_raw(entry.cookie);
        let owner = dp
            .page_tables
            .get(entry.chip_id as usize)
            .and_then(|t| t.resolve(cookie))
            .filter(|o| o.kind == PoolKind::Rx);
        let Some(owner) = owner else {
            if bump_ratelimited(&dp.stats.rx_stale_cookie) {
                log::warn!("RX ring {}: unknown cookie {:?}", self.ring_id, cookie);
            }
            return Ok(None);
        };
        let Some(pool) = dp
            .rx_pools
            .get(owner.chip as usize)
            .and_then(|c| c.get(owner.index as usize))
        else {
            bump(&dp.stats.rx_stale_cookie);
            return Ok(None);
        };

        let pool = lock(pool, "rx pool")?;
        let id = match pool.resolve(cookie) {
            Ok(id) => id,
            Err(e) => {
                if bump_ratelimited(&dp.stats.rx_stale_cookie) {
                    log::warn!("RX ring {}: {}", self.ring_id, e);
                }
                return Ok(None);
            }
        };
        let bound = pool
            .get(id)
            .and_then(|d| d.payload.as_ref())
            .map(|b| b.dma);
        if bound != Some(entry.buf_dma) {
            if bump_ratelimited(&dp.stats.rx_sanity_fail) {
                log::warn!(
                    "RX ring {}: {:?} bound to {:?}, entry says {:#x}",
                    self.ring_id,
                    cookie,
                    bound,
                    entry.buf_dma
                );
            }
            return Ok(None);
        }
        Ok(Some((owner.chip, owner.index, id)))
    }

    /// Frees the reaped descriptors and posts the same number of fresh
    /// buffers to each (chip, pool) that gave some up.
    fn release_and_refill(
        &self,
        dp: &Datapath,
        reaped: &[Reaped],
    ) -> Result<Vec<Option<RxBuf>>, FluxError> {
        let mut bufs = vec![None; reaped.len()];
        let mut buckets: Vec<(u8, u8)> = reaped.iter().map(|r| (r.chip, r.pool)).collect();
        buckets.sort_unstable();
        buckets.dedup();

        for (chip, pool_idx) in buckets {
            let (Some(pool), Some(refill)) = (
                dp.rx_pools
                    .get(chip as usize)
                    .and_then(|c| c.get(pool_idx as usize)),
                dp.refill
                    .get(chip as usize)
                    .and_then(|c| c.get(pool_idx as usize)),
            ) else {
                continue;
            };

            let mut consumed = 0;
            {
                let mut pool = lock(pool, "rx pool")?;
                for (i, r) in reaped.iter().enumerate() {
                    if (r.chip, r.pool) != (chip, pool_idx) {
                        continue;
                    }
                    let buf = pool.release(r.id).map_err(|e| dp.halt(e.into()))?;
                    if let Some(buf) = buf {
                        dp.dma.unmap(buf.dma, dp.cfg.frame_size);
                        bufs[i] = Some(buf);
                    }
                    consumed += 1;
                }
            }

            lock(refill, "refill")?.replenish(dp, consumed)?;
        }
        Ok(bufs)
    }

    fn meta(&self, entry: &RxEntry, tlv: &RxTlv) -> PacketMeta {
        let f = entry.msdu_flags;
        PacketMeta {
            peer_id: entry.peer_id,
            vdev_id: entry.vdev_id,
            tid: entry.tid,
            ring_id: self.ring_id,
            chip_id: entry.chip_id,
            first_msdu: f & msdu::FIRST_MSDU_IN_MPDU != 0,
            last_msdu: f & msdu::LAST_MSDU_IN_MPDU != 0,
            da_valid: f & msdu::DA_IS_VALID != 0 || tlv.da_valid,
            sa_valid: f & msdu::SA_IS_VALID != 0 || tlv.sa_valid,
            da_is_mcbc: f & msdu::DA_IS_MCBC != 0 || tlv.da_is_mcbc,
            intra_bss: tlv.intra_bss,
            da_peer: tlv.da_peer,
            dest_chip: tlv.dest_chip,
            retry: entry.mpdu_flags & mpdu::RETRY != 0,
            raw: entry.mpdu_flags & mpdu::RAW != 0,
            sg: entry.is_continuation(),
        }
    }

    /// Attaches one buffer to the MSDU being rebuilt.
    fn rebuild<D: Delivery>(
        &mut self,
        dp: &Datapath,
        r: &Reaped,
        buf: RxBuf,
        batcher: &mut Batcher,
        sink: &mut D,
    ) {
        let entry = &r.entry;
        let room = dp.cfg.frame_size - RX_TLV_SIZE as u32;
        let more = entry.is_continuation();
        if r.broken {
            return recycle(dp, vec![buf.addr], (r.chip, r.pool));
        }

        let Some(mut partial) = self.partial.take() else {
            let tlv = dp
                .umem
                .slice(buf.addr, RX_TLV_SIZE)
                .and_then(RxTlv::parse)
                .unwrap_or_default();
            let pad = tlv.l3_pad as u32;
            let total = entry.msdu_len as u32;
            let first_room = room.saturating_sub(pad);
            let bucket = (r.chip, r.pool);

            let mut packet = Packet::new(dp.umem.clone(), dp.frames.clone());
            packet.meta = self.meta(entry, &tlv);
            packet.push_frag(Frag {
                addr: buf.addr,
                offset: RX_TLV_SIZE as u32 + pad,
                len: total.min(first_room),
            });

            if !more && total > first_room {
                if bump_ratelimited(&dp.stats.rx_sanity_fail) {
                    log::warn!("RX ring {}: MSDU length {} overflows buffer", self.ring_id, total);
                }
                return recycle(dp, packet.take_frames(), bucket);
            }
            if more {
                self.partial = Some(Partial {
                    packet,
                    remaining: total.saturating_sub(first_room),
                    done: tlv.msdu_done,
                    overrun: false,
                    bucket,
                });
                return;
            }
            return self.finish(dp, packet, tlv.msdu_done, bucket, batcher, sink);
        };

        let len = partial.remaining.min(room);
        partial.packet.push_frag(Frag {
            addr: buf.addr,
            offset: RX_TLV_SIZE as u32,
            len,
        });
        partial.overrun |= len == 0;
        partial.remaining -= len;
        if more {
            self.partial = Some(partial);
            return;
        }
        if partial.overrun || partial.remaining != 0 {
            if bump_ratelimited(&dp.stats.rx_msdu_error) {
                log::warn!(
                    "RX ring {}: MSDU buffers disagree with its length ({} bytes short)",
                    self.ring_id,
                    partial.remaining
                );
            }
            return recycle(dp, partial.packet.take_frames(), partial.bucket);
        }
        let mut packet = partial.packet;
        packet.meta.sg = true;
        packet.meta.last_msdu = entry.msdu_flags & msdu::LAST_MSDU_IN_MPDU != 0;
        self.finish(dp, packet, partial.done, partial.bucket, batcher, sink)
    }

    /// Policy checks on a complete MSDU, then forwarding or delivery.
    fn finish<D: Delivery>(
        &mut self,
        dp: &Datapath,
        mut packet: Packet,
        done: bool,
        bucket: (u8, u8),
        batcher: &mut Batcher,
        sink: &mut D,
    ) {
        if !done {
            bump(&dp.stats.rx_msdu_not_done);
            return recycle(dp, packet.take_frames(), bucket);
        }
        if packet.meta.sg && !dp.cfg.rx_sg_enabled {
            bump(&dp.stats.rx_sg_drop);
            return recycle(dp, packet.take_frames(), bucket);
        }
        if packet.meta.tid >= dp.cfg.max_data_tids {
            if bump_ratelimited(&dp.stats.rx_invalid_tid) {
                log::warn!("RX ring {}: invalid tid {}", self.ring_id, packet.meta.tid);
            }
            return recycle(dp, packet.take_frames(), bucket);
        }
        if !batcher.switch(dp, packet.meta.peer_id, sink) {
            bump(&dp.stats.rx_no_peer_drop);
            return recycle(dp, packet.take_frames(), bucket);
        }

        let packet = {
            let (Some(peer), Some(vdev)) = (batcher.peer(), batcher.vdev()) else {
                return recycle(dp, packet.take_frames(), bucket);
            };
            if packet.meta.raw && !vdev.raw_mode {
                bump(&dp.stats.rx_raw_drop);
                bump(&peer.stats.rx_drops);
                return recycle(dp, packet.take_frames(), bucket);
            }
            if !peer.is_authorized() && !classify(packet.data()).is_auth() {
                bump(&dp.stats.rx_unauthorized_drop);
                bump(&peer.stats.rx_drops);
                return recycle(dp, packet.take_frames(), bucket);
            }

            let decision = forward::decide(dp.peers.as_ref(), peer, vdev, &packet.meta, packet.data());
            match forward::apply(dp, decision, packet, peer, vdev) {
                Some(packet) => packet,
                None => return,
            }
        };

        let len = packet.len();
        let (peer_id, tid) = (packet.meta.peer_id, packet.meta.tid);
        if let Some(peer) = batcher.peer() {
            bump(&peer.stats.rx_packets);
            add(&peer.stats.rx_bytes, len as u64);
        }
        if let Some(t) = dp.tid_stats.get(self.ring_id, tid) {
            bump(&t.delivered);
        }
        dp.hooks.telemetry.rx_msdu(peer_id, tid, self.ring_id, len);
        batcher.push(packet);
    }
}

/// Dropped RX buffers go to the reserve of the pool they came from.
fn recycle(dp: &Datapath, frames: Vec<u64>, (chip, pool): (u8, u8)) {
    let refill = dp
        .refill
        .get(chip as usize)
        .and_then(|c| c.get(pool as usize))
        .and_then(|r| r.lock().ok());
    match refill {
        Some(refill) => {
            for addr in frames {
                refill.return_to_reserve(addr, &dp.frames, &dp.stats);
            }
        }
        None => {
            for addr in frames {
                dp.frames.release(addr);
            }
        }
    }
}
