//! Per-device datapath context.
//!
//! Everything the engines share lives in one `Datapath`, created by
//! [`DatapathBuilder`](crate::builder::DatapathBuilder) and passed around as
//! `Arc<Datapath>`. Each hardware ring is still owned by exactly one engine.

use crate::config::DpConfig;
use crate::error::FluxError;
use crate::hooks::Hooks;
use crate::packet::Packet;
use crate::peer::{PeerDirectory, VdevId};
use crate::replenish::Replenisher;
use crate::rx::RxBuf;
use crate::stats::{SocStats, StatsSnapshot, TidStats};
use crate::tx::{flags, Admission, BankConfig, BankTable, ExtDesc, Flow, TxBuf, VdevCounter};
use fluxpath_core::ring::{SrcRing, TxEntry};
use fluxpath_core::umem::{FrameAllocator, UmemRegion};
use fluxpath_core::{Cookie, DescId, DescPool, DmaAddr, DmaMapper, PageTable, PoolKind};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const NO_BANK: u8 = u8::MAX;

pub(crate) struct VdevSlot {
    pub(crate) attached: AtomicBool,
    pub(crate) bank: AtomicU8,
    pub(crate) tx: VdevCounter,
}

impl VdevSlot {
    pub(crate) fn new() -> Self {
        Self {
            attached: AtomicBool::new(false),
            bank: AtomicU8::new(NO_BANK),
            tx: VdevCounter::default(),
        }
    }
}

pub(crate) fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, FluxError> {
    m.lock()
        .map_err(|_| FluxError::Corruption(format!("{} lock poisoned", what)))
}

pub struct Datapath {
    pub(crate) cfg: DpConfig,
    pub(crate) umem: Arc<UmemRegion>,
    pub(crate) frames: Arc<FrameAllocator>,
    pub(crate) dma: Arc<dyn DmaMapper>,
    pub(crate) page_tables: Vec<PageTable>,
    /// Indexed `[chip][pool]`.
    pub(crate) rx_pools: Vec<Vec<Mutex<DescPool<RxBuf>>>>,
    pub(crate) refill: Vec<Vec<Mutex<Replenisher>>>,
    pub(crate) tx_pools: Vec<Mutex<DescPool<TxBuf>>>,
    pub(crate) ext_pool: Mutex<DescPool<ExtDesc>>,
    pub(crate) tx_rings: Vec<Mutex<SrcRing<TxEntry>>>,
    pub(crate) banks: BankTable,
    pub(crate) admission: Admission,
    pub(crate) vdevs: Vec<VdevSlot>,
    pub(crate) peers: Arc<dyn PeerDirectory>,
    pub(crate) hooks: Hooks,
    pub(crate) stats: SocStats,
    pub(crate) tid_stats: TidStats,
    pub(crate) halted: AtomicBool,
}

impl Datapath {
    pub fn config(&self) -> &DpConfig {
        &self.cfg
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn counters(&self) -> &SocStats {
        &self.stats
    }

    pub fn tid_stats(&self) -> &TidStats {
        &self.tid_stats
    }

    pub fn umem(&self) -> &Arc<UmemRegion> {
        &self.umem
    }

    pub fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }

    pub fn peers(&self) -> &Arc<dyn PeerDirectory> {
        &self.peers
    }

    pub fn banks(&self) -> &BankTable {
        &self.banks
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Copies `data` into a fresh packet backed by this device's buffers.
    pub fn alloc_packet(&self, data: &[u8]) -> Option<Packet> {
        Packet::from_bytes(self.umem.clone(), self.frames.clone(), data)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Latches the device into the halted state and hands the error back.
    pub(crate) fn halt(&self, err: FluxError) -> FluxError {
        if !self.halted.swap(true, Ordering::AcqRel) {
            log::error!("datapath halted: {}", err);
        }
        err
    }

    pub(crate) fn check_halted(&self) -> Result<(), FluxError> {
        if self.is_halted() {
            return Err(FluxError::Halted);
        }
        Ok(())
    }

    pub(crate) fn vdev_slot(&self, id: VdevId) -> Option<&VdevSlot> {
        self.vdevs.get(id as usize)
    }

    pub fn vdev_attached(&self, id: VdevId) -> bool {
        self.vdev_slot(id)
            .map(|s| s.attached.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Outstanding TX descriptors charged to `id`.
    pub fn vdev_outstanding(&self, id: VdevId) -> u32 {
        self.vdev_slot(id).map(|s| s.tx.outstanding()).unwrap_or(0)
    }

    pub fn vdev_bank(&self, id: VdevId) -> Option<u8> {
        let bank = self.vdev_slot(id)?.bank.load(Ordering::Acquire);
        (bank != NO_BANK).then_some(bank)
    }

    /// Opens a vdev for transmission with the given bank configuration.
    pub fn vdev_attach(&self, id: VdevId, config: BankConfig) -> Result<u8, FluxError> {
        self.check_halted()?;
        let slot = self.vdev_slot(id).ok_or_else(|| {
            FluxError::InvalidConfiguration(format!("vdev {} beyond max_vdevs", id))
        })?;
        if slot.attached.load(Ordering::Acquire) {
            return self.vdev_update(id, config);
        }
        let bank = self.banks.get(&config).map_err(|e| self.halt(e))?;
        slot.bank.store(bank, Ordering::Release);
        slot.attached.store(true, Ordering::Release);
        log::info!("vdev {} attached on TX bank {}", id, bank);
        Ok(bank)
    }

    /// Re-resolves the bank after the vdev's transmit parameters changed.
    pub fn vdev_update(&self, id: VdevId, config: BankConfig) -> Result<u8, FluxError> {
        let slot = self.vdev_slot(id).ok_or(FluxError::VdevDown(id))?;
        let old = slot.bank.load(Ordering::Acquire);
        if old == NO_BANK {
            return Err(FluxError::VdevDown(id));
        }
        let bank = self.banks.update(old, &config).map_err(|e| self.halt(e))?;
        slot.bank.store(bank, Ordering::Release);
        if bank != old {
            log::info!("vdev {} moved from TX bank {} to {}", id, old, bank);
        }
        Ok(bank)
    }

    /// Detaches a vdev and walks the TX pools once for its descriptors.
    ///
    /// With `force` the device is assumed stopped and every descriptor is
    /// released on the spot. Otherwise descriptors still owned by the device
    /// are marked flushed and released when their completion arrives.
    /// Returns the number of descriptors touched.
    pub fn vdev_detach(&self, id: VdevId, force: bool) -> Result<usize, FluxError> {
        let slot = self.vdev_slot(id).ok_or(FluxError::VdevDown(id))?;
        if !slot.attached.swap(false, Ordering::AcqRel) {
            return Ok(0);
        }

        let mut touched = 0;
        let mut share = 0;
        for pool in &self.tx_pools {
            let mut pool = lock(pool, "tx pool")?;
            let mut doomed = Vec::new();
            pool.walk_in_use(|desc_id, desc| {
                let Some(buf) = desc.payload.as_mut() else {
                    return;
                };
                if buf.vdev_id != id {
                    return;
                }
                touched += 1;
                if force {
                    doomed.push(desc_id);
                } else {
                    buf.flags |= flags::FLUSHED;
                    if buf.counted_vdev.take().is_some() {
                        share += 1;
                    }
                }
            });
            for desc_id in doomed {
                drop(self.free_tx_desc(&mut pool, desc_id)?);
            }
        }
        self.admission.drop_vdev_share(&slot.tx, share);

        let bank = slot.bank.swap(NO_BANK, Ordering::AcqRel);
        if bank != NO_BANK {
            self.banks.put(bank);
        }
        log::info!(
            "vdev {} detached, {} TX descriptors {}",
            id,
            touched,
            if force { "released" } else { "flushed" }
        );
        Ok(touched)
    }

    /// Stops the whole device: detaches every vdev and takes back all RX buffers.
    pub fn teardown(&self) -> Result<(), FluxError> {
        for id in 0..self.vdevs.len() {
            self.vdev_detach(id as VdevId, true)?;
        }
        let mut reclaimed = 0;
        for chip in &self.rx_pools {
            for pool in chip {
                let mut pool = lock(pool, "rx pool")?;
                let mut ids = Vec::new();
                pool.walk_in_use(|id, _| ids.push(id));
                for id in ids {
                    if let Some(buf) = pool.release(id)? {
                        self.dma.unmap(buf.dma, self.cfg.frame_size);
                        self.frames.release(buf.addr);
                        reclaimed += 1;
                    }
                }
            }
        }
        log::info!("datapath torn down, {} RX buffers reclaimed", reclaimed);
        Ok(())
    }

    /// Releases a TX descriptor with everything hanging off it and returns the frame.
    pub(crate) fn free_tx_desc(
        &self,
        pool: &mut DescPool<TxBuf>,
        id: DescId,
    ) -> Result<Option<Packet>, FluxError> {
        let Some(mut buf) = pool.release(id)? else {
            return Ok(None);
        };
        for (dma, len) in buf.dma.drain(..) {
            self.dma.unmap(dma, len);
        }
        if let Some(ext) = buf.ext.take() {
            let mut ext_pool = lock(&self.ext_pool, "tx ext pool")?;
            ext_pool.release(ext)?;
        }
        let vdev = buf.counted_vdev.and_then(|v| self.vdev_slot(v));
        let flow = self.admission.release(vdev.map(|s| &s.tx), 1);
        if let Some(v) = buf.counted_vdev {
            self.signal_flow(v, flow);
        }
        Ok(buf.packet.take())
    }

    pub(crate) fn signal_flow(&self, vdev: VdevId, flow: Flow) {
        let Some(hook) = self.hooks.flow.as_ref() else {
            return;
        };
        match flow {
            Flow::Pause => {
                log::debug!("vdev {} TX paused", vdev);
                hook.pause(vdev)
            }
            Flow::Resume => {
                log::debug!("vdev {} TX resumed", vdev);
                hook.resume(vdev)
            }
            Flow::Unchanged => {}
        }
    }

    /// Rings every TX doorbell that coalescing left pending.
    pub fn flush_tx_doorbells(&self) -> u32 {
        let mut rung = 0;
        for ring in &self.tx_rings {
            let Ok(mut ring) = ring.lock() else {
                continue;
            };
            if ring.pending() > 0 {
                ring.flush();
                rung += 1;
            }
        }
        crate::stats::add(&self.stats.tx_doorbells, rung as u64);
        rung
    }

    /// Descriptor handle a cookie-converting device writes into completions:
    /// pool index in bits 24..32, descriptor index below.
    pub fn tx_desc_handle(&self, cookie: u32) -> Option<u32> {
        let cookie = Cookie::from_raw(cookie);
        let owner = self.page_tables.first()?.resolve(cookie)?;
        if owner.kind != PoolKind::Tx {
            return None;
        }
        let pool = lock(self.tx_pools.get(owner.index as usize)?, "tx pool").ok()?;
        let id = pool.locate(cookie)?;
        Some(((owner.index as u32) << 24) | (id.0 & 0x00FF_FFFF))
    }

    /// Fragment list behind an extension descriptor cookie.
    pub fn ext_frags(&self, cookie: u32) -> Option<Vec<(DmaAddr, u32)>> {
        let pool = self.ext_pool.lock().ok()?;
        let id = pool.resolve(Cookie::from_raw(cookie)).ok()?;
        pool.get(id)?.payload.as_ref().map(|e| e.frags.clone())
    }

    pub fn rx_in_use(&self, chip: u8, pool: u8) -> usize {
        self.rx_pools
            .get(chip as usize)
            .and_then(|c| c.get(pool as usize))
            .and_then(|p| p.lock().ok().map(|p| p.in_use()))
            .unwrap_or(0)
    }

    pub fn tx_in_use(&self) -> usize {
        self.tx_pools
            .iter()
            .filter_map(|p| p.lock().ok().map(|p| p.in_use()))
            .sum()
    }

    pub fn ext_in_use(&self) -> usize {
        self.ext_pool.lock().map(|p| p.in_use()).unwrap_or(0)
    }

    pub fn reserve_len(&self, chip: u8, pool: u8) -> usize {
        self.refill
            .get(chip as usize)
            .and_then(|c| c.get(pool as usize))
            .and_then(|r| r.lock().ok().map(|r| r.reserve().len()))
            .unwrap_or(0)
    }
}
