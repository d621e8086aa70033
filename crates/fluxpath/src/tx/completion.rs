//! TX completion reaping.
//!
//! Entries are collected inside the ring access window and processed after
//! it closes, so the ring is handed back to the device as early as possible.

use crate::config::CookieMode;
use crate::context::{lock, Datapath};
use crate::error::FluxError;
use crate::packet::Packet;
use crate::peer::{PeerId, PeerRef, INVALID_PEER};
use crate::stats::{add, bump, bump_ratelimited};
use crate::tx::status::{decode, fw_status, ReinjectReason, TxOutcome};
use crate::tx::{flags, TxBuf, TxParams};
use fluxpath_core::ring::entry::{release_src, DESC_VA_INVALIDATED};
use fluxpath_core::ring::{DstRing, TxCompEntry};
use fluxpath_core::{Cookie, DescId, PoolKind};
use std::sync::Arc;

struct Completed {
    entry: TxCompEntry,
    pool: u8,
    id: DescId,
}

pub struct TxCompletion {
    dp: Arc<Datapath>,
    ring: DstRing<TxCompEntry>,
    ring_id: u8,
}

impl TxCompletion {
    pub fn new(dp: Arc<Datapath>, ring: DstRing<TxCompEntry>, ring_id: u8) -> Self {
        Self { dp, ring, ring_id }
    }

    pub fn ring_id(&self) -> u8 {
        self.ring_id
    }

    /// Reaps up to `quota` completions and releases their descriptors.
    pub fn reap(&mut self, quota: u32) -> Result<usize, FluxError> {
        let dp = self.dp.clone();
        dp.check_halted()?;

        if let Err(e) = self.ring.access_start() {
            if bump_ratelimited(&dp.stats.comp_ring_access_fail) {
                log::warn!("completion ring {}: {}", self.ring_id, e);
            }
            return Ok(0);
        }
        let done = self.collect(&dp, quota);
        self.ring.access_end();
        let done = done?;
        add(&dp.stats.comp_reaped, done.len() as u64);

        let count = done.len();
        self.process(&dp, done)?;
        if count > 0 {
            log::trace!("completion ring {}: reaped {}", self.ring_id, count);
        }
        Ok(count)
    }

    fn collect(&mut self, dp: &Datapath, quota: u32) -> Result<Vec<Completed>, FluxError> {
        let limit = quota.min(dp.cfg.max_reap_limit) as usize;
        let mut done = Vec::with_capacity(limit);

        while done.len() < limit {
            let Some(mut entry) = self.ring.next() else {
                break;
            };

            let valid = matches!(entry.release_src, release_src::TQM | release_src::FW);
            if !valid {
                if bump_ratelimited(&dp.stats.comp_invalid_source) {
                    log::warn!(
                        "completion ring {}: invalid release source {}",
                        self.ring_id,
                        entry.release_src
                    );
                }
            } else if entry.release_src == release_src::FW && entry.status == fw_status::MEC_NOTIFY {
                // Address-learning notice, no descriptor attached.
                bump(&dp.stats.comp_mec_notify);
                continue;
            }

            // A bad cookie behind a bad source tag is not worth a halt.
            match self.locate(dp, &mut entry) {
                Ok((pool, id)) => done.push(Completed { entry, pool, id }),
                Err(e) if valid => return Err(dp.halt(e)),
                Err(e) => log::debug!("completion ring {}: entry skipped: {}", self.ring_id, e),
            }
        }
        Ok(done)
    }

    /// Finds the descriptor an entry completes, from the device-converted
    /// handle or from the cookie.
    fn locate(&mut self, dp: &Datapath, entry: &mut TxCompEntry) -> Result<(u8, DescId), FluxError> {
        if dp.cfg.cookie_mode != CookieMode::Hardware || entry.cc_done == 0 {
            return self.resolve_cookie(dp, entry);
        }
        if entry.desc_va_hi() == DESC_VA_INVALIDATED {
            return Err(FluxError::Corruption(format!(
                "completion ring {}: entry for handle {:#x} replayed",
                self.ring_id, entry.desc_va as u32
            )));
        }
        let handle = entry.desc_va as u32;
        entry.invalidate();
        self.ring.rewrite_last(*entry);
        let (pool, id) = ((handle >> 24) as u8, DescId(handle & 0x00FF_FFFF));
        self.check_live(dp, pool, id, entry)?;
        Ok((pool, id))
    }

    fn resolve_cookie(&self, dp: &Datapath, entry: &TxCompEntry) -> Result<(u8, DescId), FluxError> {
        let cookie = Cookie::from_raw(entry.cookie);
        let owner = dp
            .page_tables
            .first()
            .and_then(|t| t.resolve(cookie))
            .filter(|o| o.kind == PoolKind::Tx)
            .ok_or(FluxError::InvalidCookie(entry.cookie))?;
        let pool = dp
            .tx_pools
            .get(owner.index as usize)
            .ok_or(FluxError::InvalidCookie(entry.cookie))?;
        let pool = lock(pool, "tx pool")?;
        let id = pool.resolve(cookie).map_err(|e| {
            FluxError::Corruption(format!("completion ring {}: {}", self.ring_id, e))
        })?;
        let bound = pool
            .get(id)
            .and_then(|d| d.payload.as_ref())
            .and_then(|b| b.dma.first().map(|(addr, _)| *addr));
        if bound.is_some() && bound != Some(entry.buf_dma) {
            return Err(FluxError::Corruption(format!(
                "completion ring {}: {:?} bound to {:#x}, entry says {:#x}",
                self.ring_id,
                cookie,
                bound.unwrap_or(0),
                entry.buf_dma
            )));
        }
        Ok((owner.index, id))
    }

    /// A device-converted handle must still name a descriptor in flight.
    fn check_live(&self, dp: &Datapath, pool: u8, id: DescId, entry: &TxCompEntry) -> Result<(), FluxError> {
        let live = dp
            .tx_pools
            .get(pool as usize)
            .map(|p| lock(p, "tx pool"))
            .transpose()?
            .map(|p| p.get(id).map(|d| d.is_in_use()).unwrap_or(false))
            .unwrap_or(false);
        if !live {
            return Err(FluxError::Corruption(format!(
                "completion ring {}: cookie {:#x} names a free descriptor {}/{}",
                self.ring_id, entry.cookie, pool, id.0
            )));
        }
        Ok(())
    }

    fn process(&self, dp: &Datapath, done: Vec<Completed>) -> Result<(), FluxError> {
        let mut peer: Option<PeerRef> = None;

        for c in done {
            let (buf, packet) = {
                let Some(pool) = dp.tx_pools.get(c.pool as usize) else {
                    continue;
                };
                let mut pool = lock(pool, "tx pool")?;
                let Some(meta) = pool
                    .get(c.id)
                    .and_then(|d| d.payload.as_ref())
                    .map(Meta::from)
                else {
                    continue;
                };
                let packet = dp.free_tx_desc(&mut pool, c.id).map_err(|e| dp.halt(e))?;
                (meta, packet)
            };

            if buf.flags & flags::FLUSHED != 0 {
                bump(&dp.stats.comp_freed_in_detach);
                continue;
            }

            let peer_id = if c.entry.peer_id != INVALID_PEER {
                c.entry.peer_id
            } else {
                buf.peer_id
            };
            if peer.as_ref().map(|p| p.id) != Some(peer_id) {
                peer = dp.peers.peer(peer_id);
            }

            let outcome = decode(&c.entry);
            self.dispatch(dp, outcome, packet, &buf, peer.as_ref(), peer_id);
        }
        Ok(())
    }

    fn dispatch(
        &self,
        dp: &Datapath,
        outcome: TxOutcome,
        packet: Option<Packet>,
        buf: &Meta,
        peer: Option<&PeerRef>,
        peer_id: PeerId,
    ) {
        dp.hooks
            .telemetry
            .tx_completion(peer_id, buf.tid, &outcome, buf.len as usize);

        match outcome {
            TxOutcome::Acked => {
                bump(&dp.stats.comp_acked);
                if let Some(p) = peer {
                    bump(&p.stats.tx_acked);
                }
            }
            TxOutcome::Dropped(reason) => {
                bump(&dp.stats.comp_dropped);
                if let Some(p) = peer {
                    bump(&p.stats.tx_dropped);
                    bump(p.stats.tx_drop.for_reason(reason));
                }
                log::trace!("TX to peer {} dropped: {:?}", peer_id, reason);
            }
            TxOutcome::VdevMismatch => {
                bump(&dp.stats.comp_vdev_mismatch);
            }
            TxOutcome::MecNotify => {
                bump(&dp.stats.comp_mec_notify);
            }
            TxOutcome::Reinject(reason) => {
                let Some(packet) = packet else {
                    return;
                };
                if reason == ReinjectReason::MloMcast {
                    if let Some(fanout) = dp.hooks.mcast_fanout.as_ref() {
                        fanout.fan_out(packet, buf.vdev_id);
                        bump(&dp.stats.tx_mcast_fanout);
                        return;
                    }
                }
                let params = TxParams::new(buf.vdev_id)
                    .tid(buf.tid)
                    .peer(peer_id)
                    .reinject();
                match dp.send_exception(packet, params) {
                    Ok(()) => bump(&dp.stats.tx_reinjected),
                    Err(reject) => {
                        if bump_ratelimited(&dp.stats.tx_reinject_fail) {
                            log::warn!("reinject to vdev {} failed: {}", buf.vdev_id, reject);
                        }
                    }
                }
            }
            TxOutcome::Inspect => {
                bump(&dp.stats.comp_inspected);
                if let (Some(inspector), Some(packet)) = (dp.hooks.inspector.as_ref(), packet.as_ref()) {
                    inspector.inspect(packet, buf.vdev_id, peer_id);
                }
            }
            TxOutcome::Unknown(code) => {
                if let Some(p) = peer {
                    bump(&p.stats.tx_dropped);
                    bump(&p.stats.tx_drop.invalid_rr);
                }
                if bump_ratelimited(&dp.stats.comp_dropped) {
                    log::warn!("TX completion with unknown status {}", code);
                }
            }
        }
    }
}

/// What is left of a [`TxBuf`] once the descriptor went back to the pool.
struct Meta {
    vdev_id: u8,
    peer_id: PeerId,
    tid: u8,
    flags: u16,
    len: u32,
}

impl From<&TxBuf> for Meta {
    fn from(buf: &TxBuf) -> Self {
        Self {
            vdev_id: buf.vdev_id,
            peer_id: buf.peer_id,
            tid: buf.tid,
            flags: buf.flags,
            len: buf.len,
        }
    }
}
