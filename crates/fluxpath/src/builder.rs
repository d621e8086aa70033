use crate::config::{CookieMode, DpConfig, Poller};
use crate::context::{lock, Datapath, VdevSlot};
use crate::error::FluxError;
use crate::hooks::{CrossLink, FlowControl, Hooks, Inspector, McastFanout};
use crate::peer::{PeerDirectory, PeerTable};
use crate::replenish::Replenisher;
use crate::rx::RxReaper;
use crate::stats::{SocStats, Telemetry, TidStats};
use crate::tx::{Admission, BankTable, TxCompletion};
use fluxpath_core::cookie::MAX_PAGES;
use fluxpath_core::ring::{DstRing, RefillEntry, RingMem, RxEntry, SrcRing, TxCompEntry, TxEntry};
use fluxpath_core::umem::{FrameAllocator, UmemLayout, UmemRegion};
use fluxpath_core::{DescPool, DmaMapper, PageTable, PoolId, PoolKind, UmemDma};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

/// Device-side ends of every ring the datapath uses.
///
/// A real device owns these through its own mappings; the simulator drives
/// them directly.
pub struct DeviceRings {
    /// RX destination rings, written by the device.
    pub rx: Vec<SrcRing<RxEntry>>,
    /// Refill rings indexed `[chip][pool]`, read by the device.
    pub refill: Vec<Vec<DstRing<RefillEntry>>>,
    pub tx: Vec<DstRing<TxEntry>>,
    pub comp: Vec<SrcRing<TxCompEntry>>,
    pub rx_mem: Vec<Arc<RingMem<RxEntry>>>,
    pub comp_mem: Vec<Arc<RingMem<TxCompEntry>>>,
}

/// Everything `build` produces. Each engine is handed to exactly one
/// worker context.
pub struct DpParts {
    pub datapath: Arc<Datapath>,
    pub rx: Vec<RxReaper>,
    pub completions: Vec<TxCompletion>,
    pub device: DeviceRings,
}

pub struct DatapathBuilder {
    cfg: DpConfig,
    peers: Option<Arc<dyn PeerDirectory>>,
    hooks: Hooks,
    dma: Option<Arc<dyn DmaMapper>>,
}

impl Default for DatapathBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatapathBuilder {
    pub fn new() -> Self {
        Self {
            cfg: DpConfig::default(),
            peers: None,
            hooks: Hooks::default(),
            dma: None,
        }
    }

    pub fn config(mut self, cfg: DpConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn chips(mut self, chips: u8) -> Self {
        self.cfg.num_chips = chips;
        self
    }

    pub fn rx_pools(mut self, per_chip: u8, descs: u32) -> Self {
        self.cfg.rx_pools_per_chip = per_chip;
        self.cfg.rx_descs_per_pool = descs;
        self
    }

    pub fn rx_rings(mut self, count: u8, size: u32) -> Self {
        self.cfg.num_rx_rings = count;
        self.cfg.rx_ring_size = size;
        self
    }

    pub fn frames(mut self, count: u32, size: u32) -> Self {
        self.cfg.frame_count = count;
        self.cfg.frame_size = size;
        self
    }

    pub fn tx_pools(mut self, count: u8, descs: u32) -> Self {
        self.cfg.tx_pools = count;
        self.cfg.tx_descs_per_pool = descs;
        self
    }

    pub fn quotas(mut self, rx: u32, tx_comp: u32) -> Self {
        self.cfg.rx_quota = rx;
        self.cfg.tx_comp_quota = tx_comp;
        self
    }

    /// Global and per-vdev outstanding TX ceilings.
    pub fn ceilings(mut self, global: u32, per_vdev: u32) -> Self {
        self.cfg.max_tx_outstanding = global;
        self.cfg.max_vdev_tx_outstanding = per_vdev;
        self
    }

    pub fn cookie_mode(mut self, mode: CookieMode) -> Self {
        self.cfg.cookie_mode = mode;
        self
    }

    pub fn doorbell_coalesce(mut self, on: bool) -> Self {
        self.cfg.doorbell_coalesce = on;
        self
    }

    pub fn poller(mut self, poller: Poller) -> Self {
        self.cfg.poller = poller;
        self
    }

    pub fn peers(mut self, peers: Arc<dyn PeerDirectory>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.hooks.telemetry = telemetry;
        self
    }

    pub fn inspector(mut self, inspector: Arc<dyn Inspector>) -> Self {
        self.hooks.inspector = Some(inspector);
        self
    }

    pub fn mcast_fanout(mut self, fanout: Arc<dyn McastFanout>) -> Self {
        self.hooks.mcast_fanout = Some(fanout);
        self
    }

    pub fn cross_link(mut self, link: Arc<dyn CrossLink>) -> Self {
        self.hooks.cross_link = Some(link);
        self
    }

    pub fn flow_control(mut self, flow: Arc<dyn FlowControl>) -> Self {
        self.hooks.flow = Some(flow);
        self
    }

    pub fn dma(mut self, dma: Arc<dyn DmaMapper>) -> Self {
        self.dma = Some(dma);
        self
    }

    pub fn build(self) -> Result<DpParts, FluxError> {
        let cfg = self.cfg;
        cfg.validate()?;

        // 1. Buffer region
        let layout = UmemLayout::new(cfg.frame_size, cfg.frame_count)?;
        let umem = Arc::new(UmemRegion::new(layout)?);
        let frames = Arc::new(FrameAllocator::new(layout));
        let dma = self
            .dma
            .unwrap_or_else(|| Arc::new(UmemDma::new(0x1000_0000)) as Arc<dyn DmaMapper>);

        // 2. Descriptor pools and their cookie pages
        let mut page_tables: Vec<PageTable> = (0..cfg.num_chips)
            .map(|chip| PageTable::new(chip, MAX_PAGES))
            .collect();

        let mut rx_pools = Vec::with_capacity(cfg.num_chips as usize);
        for chip in 0..cfg.num_chips {
            let table = &mut page_tables[chip as usize];
            let mut pools = Vec::with_capacity(cfg.rx_pools_per_chip as usize);
            for index in 0..cfg.rx_pools_per_chip {
                let id = PoolId::new(chip, PoolKind::Rx, index);
                let base = table.reserve(id, cfg.rx_descs_per_pool)?;
                pools.push(Mutex::new(DescPool::new(id, cfg.rx_descs_per_pool, base)));
            }
            rx_pools.push(pools);
        }

        // TX pools live on the first chip's table.
        let table = &mut page_tables[0];
        let mut tx_pools = Vec::with_capacity(cfg.tx_pools as usize);
        for index in 0..cfg.tx_pools {
            let id = PoolId::new(0, PoolKind::Tx, index);
            let base = table.reserve(id, cfg.tx_descs_per_pool)?;
            tx_pools.push(Mutex::new(DescPool::new(id, cfg.tx_descs_per_pool, base)));
        }
        let ext_id = PoolId::new(0, PoolKind::TxExt, 0);
        let ext_base = table.reserve(ext_id, cfg.tx_ext_descs)?;
        let ext_pool = Mutex::new(DescPool::new(ext_id, cfg.tx_ext_descs, ext_base));

        // 3. Rings
        let mut refill = Vec::with_capacity(cfg.num_chips as usize);
        let mut dev_refill = Vec::with_capacity(cfg.num_chips as usize);
        for chip in 0..cfg.num_chips {
            let mut host = Vec::new();
            let mut dev = Vec::new();
            for pool in 0..cfg.rx_pools_per_chip {
                let mem = RingMem::<RefillEntry>::new(cfg.refill_ring_size)?;
                host.push(Mutex::new(Replenisher::new(
                    chip,
                    pool,
                    SrcRing::new(mem.clone()),
                    &cfg,
                )));
                dev.push(DstRing::new(mem));
            }
            refill.push(host);
            dev_refill.push(dev);
        }

        let mut rx_rings = Vec::with_capacity(cfg.num_rx_rings as usize);
        let mut dev_rx = Vec::with_capacity(cfg.num_rx_rings as usize);
        let mut rx_mem = Vec::with_capacity(cfg.num_rx_rings as usize);
        for _ in 0..cfg.num_rx_rings {
            let mem = RingMem::<RxEntry>::new(cfg.rx_ring_size)?;
            rx_rings.push(
                DstRing::new(mem.clone()).with_near_full(cfg.near_full_entries(cfg.rx_ring_size)),
            );
            dev_rx.push(SrcRing::new(mem.clone()));
            rx_mem.push(mem);
        }

        let mut tx_rings = Vec::with_capacity(cfg.num_tx_rings as usize);
        let mut dev_tx = Vec::with_capacity(cfg.num_tx_rings as usize);
        let mut comp_rings = Vec::with_capacity(cfg.num_tx_rings as usize);
        let mut dev_comp = Vec::with_capacity(cfg.num_tx_rings as usize);
        let mut comp_mem = Vec::with_capacity(cfg.num_tx_rings as usize);
        for _ in 0..cfg.num_tx_rings {
            let mem = RingMem::<TxEntry>::new(cfg.tx_ring_size)?;
            tx_rings.push(Mutex::new(SrcRing::new(mem.clone())));
            dev_tx.push(DstRing::new(mem));

            let mem = RingMem::<TxCompEntry>::new(cfg.comp_ring_size)?;
            comp_rings.push(
                DstRing::new(mem.clone()).with_near_full(cfg.near_full_entries(cfg.comp_ring_size)),
            );
            dev_comp.push(SrcRing::new(mem.clone()));
            comp_mem.push(mem);
        }

        // 4. Shared context
        let admission = Admission::new(
            cfg.max_tx_outstanding,
            cfg.max_vdev_tx_outstanding,
            cfg.tx_special_allowance,
            cfg.flow_resume_pct,
        );
        let vdevs = (0..cfg.max_vdevs).map(|_| VdevSlot::new()).collect();
        let tid_stats = TidStats::new(cfg.num_rx_rings as usize, cfg.max_data_tids as usize);
        let banks = BankTable::new(cfg.bank_slots);
        let peers = self
            .peers
            .unwrap_or_else(|| Arc::new(PeerTable::new()) as Arc<dyn PeerDirectory>);

        let dp = Arc::new(Datapath {
            cfg,
            umem,
            frames,
            dma,
            page_tables,
            rx_pools,
            refill,
            tx_pools,
            ext_pool,
            tx_rings,
            banks,
            admission,
            vdevs,
            peers,
            hooks: self.hooks,
            stats: SocStats::default(),
            tid_stats,
            halted: AtomicBool::new(false),
        });

        // 5. Prime the refill rings
        for chip in &dp.refill {
            for rep in chip {
                lock(rep, "refill")?.initial_fill(&dp)?;
            }
        }

        let rx = rx_rings
            .into_iter()
            .enumerate()
            .map(|(i, ring)| RxReaper::new(dp.clone(), ring, i as u8))
            .collect();
        let completions = comp_rings
            .into_iter()
            .enumerate()
            .map(|(i, ring)| TxCompletion::new(dp.clone(), ring, i as u8))
            .collect();

        log::info!(
            "datapath up: {} chips, {} RX rings, {} TX rings, {} frames of {} bytes",
            dp.cfg.num_chips,
            dp.cfg.num_rx_rings,
            dp.cfg.num_tx_rings,
            dp.cfg.frame_count,
            dp.cfg.frame_size
        );

        Ok(DpParts {
            datapath: dp,
            rx,
            completions,
            device: DeviceRings {
                rx: dev_rx,
                refill: dev_refill,
                tx: dev_tx,
                comp: dev_comp,
                rx_mem,
                comp_mem,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_primes_refill_rings() {
        let parts = DatapathBuilder::new()
            .chips(2)
            .rx_pools(2, 64)
            .frames(1024, 2048)
            .build()
            .unwrap();
        let dp = &parts.datapath;

        // 1. Every (chip, pool) got a full refill ring worth of buffers
        for chip in 0..2 {
            for pool in 0..2 {
                assert_eq!(dp.rx_in_use(chip, pool), 64);
            }
        }
        assert_eq!(dp.stats().refill_posted, 256);
        assert_eq!(dp.frames().available(), 1024 - 256);

        // 2. Device sees them
        assert_eq!(parts.device.refill[1][1].pending(), 64);
        assert_eq!(parts.rx.len(), 1);
        assert_eq!(parts.completions.len(), 1);
    }

    #[test]
    fn test_build_rejects_bad_config() {
        let res = DatapathBuilder::new().tx_pools(0, 16).build();
        assert!(matches!(res, Err(FluxError::InvalidConfiguration(_))));
    }
}
