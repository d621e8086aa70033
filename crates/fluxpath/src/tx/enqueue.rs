//! TX submission path.
//!
//! Lock order: TX descriptor pool, then extension pool. The ring lock is
//! only taken after both are released.

use crate::context::{lock, Datapath};
use crate::error::FluxError;
use crate::packet::Packet;
use crate::peer::VdevId;
use crate::stats::{add, bump};
use crate::tx::{flags, ExtDesc, TxBuf, TxParams, TxReject};
use fluxpath_core::ring::entry::tx;
use fluxpath_core::ring::TxEntry;
use fluxpath_core::{DescId, DescPool, DescState, DmaAddr};
use fluxpath_proto::classify;
use std::sync::atomic::Ordering;

type Prepared = (DescId, TxEntry);

impl Datapath {
    /// Regular transmit of one frame on `vdev`.
    pub fn send(&self, vdev: VdevId, packet: Packet) -> Result<(), TxReject> {
        let params = TxParams::new(vdev).tid(packet.meta.tid);
        self.enqueue(vec![packet], params)
    }

    /// Transmit with caller-supplied metadata (peer override, firmware
    /// routing, reinjection).
    pub fn send_exception(&self, packet: Packet, params: TxParams) -> Result<(), TxReject> {
        self.enqueue(vec![packet], params)
    }

    /// Transmits the segments of one large frame. Either every segment is
    /// queued or none is, and the frames come back in the rejection.
    pub fn send_segments(&self, segments: Vec<Packet>, params: TxParams) -> Result<(), TxReject> {
        self.enqueue(segments, params)
    }

    fn enqueue(&self, packets: Vec<Packet>, params: TxParams) -> Result<(), TxReject> {
        if packets.is_empty() {
            return Ok(());
        }
        if self.is_halted() {
            return Err(TxReject::new(FluxError::Halted, packets));
        }
        let vdev = params.vdev_id;
        let Some(slot) = self
            .vdev_slot(vdev)
            .filter(|s| s.attached.load(Ordering::Acquire))
        else {
            bump(&self.stats.tx_vdev_down);
            return Err(TxReject::new(FluxError::VdevDown(vdev), packets));
        };
        let bank = slot.bank.load(Ordering::Acquire);

        let n = packets.len() as u32;
        let special = classify(packets[0].data()).is_special();
        match self.admission.acquire(&slot.tx, n, special) {
            Ok(flow) => self.signal_flow(vdev, flow),
            Err(e) => {
                bump(&self.stats.tx_admission_denied);
                return Err(TxReject::new(e, packets));
            }
        }

        let pool_idx = params.queue as usize % self.tx_pools.len();
        let ring_idx = pool_idx % self.tx_rings.len();

        let prepared = match self.prepare(pool_idx, packets, &params, bank, special) {
            Ok(prepared) => prepared,
            Err((reject, charged)) => {
                // Descriptors already freed gave back their own share.
                let flow = self.admission.release(Some(&slot.tx), n - charged);
                self.signal_flow(vdev, flow);
                return Err(reject);
            }
        };

        if let Err(e) = self.submit(ring_idx, &prepared, &params) {
            log::debug!("TX ring {} rejected {} frames: {}", ring_idx, n, e);
            let ids: Vec<DescId> = prepared.iter().map(|(id, _)| *id).collect();
            let packets = self.unwind(pool_idx, &ids);
            return Err(TxReject::new(e, packets));
        }
        add(&self.stats.tx_enqueued, n as u64);
        Ok(())
    }

    /// Builds descriptors for every packet. On failure the already prepared
    /// ones are freed and the number of admission units they returned is
    /// handed back along with the rejection.
    fn prepare(
        &self,
        pool_idx: usize,
        packets: Vec<Packet>,
        params: &TxParams,
        bank: u8,
        special: bool,
    ) -> Result<Vec<Prepared>, (TxReject, u32)> {
        let total = packets.len();
        let mut pool = match lock(&self.tx_pools[pool_idx], "tx pool") {
            Ok(pool) => pool,
            Err(e) => return Err((TxReject::new(self.halt(e), packets), 0)),
        };

        let mut prepared = Vec::with_capacity(total);
        let mut packets = packets.into_iter();
        while let Some(packet) = packets.next() {
            let last = prepared.len() + 1 == total;
            match self.prepare_one(&mut pool, packet, params, bank, special, last) {
                Ok(p) => prepared.push(p),
                Err((error, failed)) => {
                    let charged = prepared.len() as u32;
                    let mut returned = Vec::with_capacity(total);
                    for (id, _) in prepared {
                        match self.free_tx_desc(&mut pool, id) {
                            Ok(Some(p)) => returned.push(p),
                            Ok(None) => {}
                            Err(e) => {
                                self.halt(e);
                            }
                        }
                    }
                    returned.push(failed);
                    returned.extend(packets);
                    return Err((TxReject::new(error, returned), charged));
                }
            }
        }
        Ok(prepared)
    }

    fn prepare_one(
        &self,
        pool: &mut DescPool<TxBuf>,
        packet: Packet,
        params: &TxParams,
        bank: u8,
        special: bool,
        last: bool,
    ) -> Result<Prepared, (FluxError, Packet)> {
        let nfrags = packet.num_frags();
        if nfrags == 0 || nfrags > self.cfg.tx_max_frags as usize {
            return Err((
                FluxError::Exhausted(format!(
                    "{} fragments, at most {} per frame",
                    nfrags, self.cfg.tx_max_frags
                )),
                packet,
            ));
        }

        let id = match pool.allocate() {
            Ok(id) => id,
            Err(e) => {
                bump(&self.stats.tx_desc_exhausted);
                return Err((e.into(), packet));
            }
        };

        let mut dma = Vec::with_capacity(nfrags);
        for frag in packet.frags() {
            match self.dma.map(frag.data_addr(), frag.len) {
                Ok(addr) => dma.push((addr, frag.len)),
                Err(e) => {
                    bump(&self.stats.tx_dma_fail);
                    self.undo(pool, id, &dma, None);
                    return Err((e.into(), packet));
                }
            }
        }

        let ext = if nfrags > 1 {
            match self.alloc_ext(&dma) {
                Ok(ext) => Some(ext),
                Err(e) => {
                    bump(&self.stats.tx_desc_exhausted);
                    self.undo(pool, id, &dma, None);
                    return Err((e, packet));
                }
            }
        } else {
            None
        };

        let Some(desc) = pool.get_mut(id) else {
            self.undo(pool, id, &dma, ext.map(|(id, _)| id));
            return Err((
                FluxError::Corruption(format!("TX descriptor {:?} vanished", id)),
                packet,
            ));
        };
        let cookie = desc.cookie();

        let mut entry_flags = 0;
        let mut host_flags = 0;
        if ext.is_some() {
            entry_flags |= tx::EXT_DESC;
        } else {
            host_flags |= flags::SIMPLE;
        }
        if params.intra_bss {
            entry_flags |= tx::INTRA_BSS;
            host_flags |= flags::INTRA_BSS;
        }
        if params.mcast_mlo {
            entry_flags |= tx::MCAST_MLO;
            host_flags |= flags::MCAST_MLO;
        }
        if params.to_fw {
            entry_flags |= tx::TO_FW;
            host_flags |= flags::TO_FW;
        }
        if params.reinject {
            host_flags |= flags::REINJECT;
        }
        if special {
            host_flags |= flags::SPECIAL;
        }
        if last {
            entry_flags |= tx::LAST_SEGMENT;
        }

        let peer_id = params.peer_id.unwrap_or(packet.meta.peer_id);
        let len = packet.len() as u32;
        let entry = TxEntry {
            cookie: cookie.raw(),
            len,
            buf_dma: dma[0].0,
            ext_cookie: ext.map(|(_, c)| c).unwrap_or(0),
            peer_id,
            flags: entry_flags,
            bank_id: bank,
            vdev_id: params.vdev_id,
            tid: params.tid,
            num_frags: nfrags as u8,
            _pad: 0,
        };

        desc.payload = Some(TxBuf {
            packet: Some(packet),
            dma,
            ext: ext.map(|(id, _)| id),
            vdev_id: params.vdev_id,
            counted_vdev: Some(params.vdev_id),
            peer_id,
            tid: params.tid,
            flags: host_flags,
            len,
        });
        desc.set_unmapped(false);
        pool.set_state(id, DescState::InFlight);
        Ok((id, entry))
    }

    fn alloc_ext(&self, frags: &[(DmaAddr, u32)]) -> Result<(DescId, u32), FluxError> {
        let mut ext = lock(&self.ext_pool, "tx ext pool")?;
        let id = ext.allocate()?;
        let Some(desc) = ext.get_mut(id) else {
            ext.release(id)?;
            return Err(FluxError::Exhausted("tx ext pool".to_string()));
        };
        desc.payload = Some(ExtDesc {
            frags: frags.to_vec(),
        });
        let cookie = desc.cookie().raw();
        ext.set_state(id, DescState::InFlight);
        Ok((id, cookie))
    }

    /// Takes back a descriptor that never got its payload.
    fn undo(&self, pool: &mut DescPool<TxBuf>, id: DescId, dma: &[(DmaAddr, u32)], ext: Option<DescId>) {
        for &(addr, len) in dma {
            self.dma.unmap(addr, len);
        }
        if let Some(ext) = ext {
            if let Ok(mut ext_pool) = self.ext_pool.lock() {
                if let Err(e) = ext_pool.release(ext) {
                    self.halt(e.into());
                }
            }
        }
        if let Err(e) = pool.release(id) {
            self.halt(e.into());
        }
    }

    fn submit(&self, ring_idx: usize, prepared: &[Prepared], params: &TxParams) -> Result<(), FluxError> {
        let mut ring = lock(&self.tx_rings[ring_idx], "tx ring")?;
        if let Err(e) = ring.access_start() {
            bump(&self.stats.tx_ring_full);
            return Err(e.into());
        }
        if ring.num_free() < prepared.len() as u32 {
            ring.access_end_deferred();
            bump(&self.stats.tx_ring_full);
            return Err(FluxError::RingFull);
        }
        for (_, entry) in prepared {
            if let Err(e) = ring.push(*entry) {
                // Cannot happen after the space check.
                ring.access_end_deferred();
                return Err(self.halt(FluxError::Corruption(format!("TX ring push: {}", e))));
            }
        }

        let defer = self.cfg.doorbell_coalesce
            && !params.flush
            && ring.pending() < self.cfg.coalesce_max_pending;
        if defer {
            ring.access_end_deferred();
        } else {
            ring.access_end();
            bump(&self.stats.tx_doorbells);
        }
        Ok(())
    }

    /// Frees descriptors that were prepared but never reached the ring.
    fn unwind(&self, pool_idx: usize, ids: &[DescId]) -> Vec<Packet> {
        let mut packets = Vec::with_capacity(ids.len());
        let Ok(mut pool) = lock(&self.tx_pools[pool_idx], "tx pool") else {
            return packets;
        };
        for &id in ids {
            match self.free_tx_desc(&mut pool, id) {
                Ok(Some(p)) => packets.push(p),
                Ok(None) => {}
                Err(e) => {
                    self.halt(e);
                }
            }
        }
        packets
    }
}
