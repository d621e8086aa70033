//! RX buffer replenishment.
//!
//! One `Replenisher` per (chip, pool) owns the refill ring of that pool and a
//! small reserve of buffers that is tapped when the general allocator keeps
//! failing or the device is about to run dry.

pub mod reserve;

pub use reserve::ReservePool;

use crate::config::DpConfig;
use crate::context::{lock, Datapath};
use crate::error::FluxError;
use crate::rx::RxBuf;
use crate::stats::{add, bump, SocStats};
use fluxpath_core::ring::{RefillEntry, SrcRing};
use fluxpath_core::umem::FrameAllocator;
use fluxpath_core::{DescPool, DescState};
use std::sync::Mutex;

pub struct Replenisher {
    chip: u8,
    pool: u8,
    ring: SrcRing<RefillEntry>,
    reserve: ReservePool,
    failures: u32,
    fail_threshold: u32,
    /// Consumed buffers that could not be replaced yet.
    deficit: u32,
    /// Refill ring occupancy under which the reserve is used right away.
    low_watermark: u32,
    burst: u32,
    frame_size: u32,
}

impl Replenisher {
    pub fn new(chip: u8, pool: u8, ring: SrcRing<RefillEntry>, cfg: &DpConfig) -> Self {
        let low_watermark =
            (ring.size() as u64 * cfg.reserve_low_watermark_pct as u64 / 100) as u32;
        Self {
            chip,
            pool,
            ring,
            reserve: ReservePool::new(cfg.reserve_size),
            failures: 0,
            deficit: 0,
            fail_threshold: cfg.reserve_fail_threshold.max(1),
            low_watermark,
            burst: cfg.rx_refill_burst,
            frame_size: cfg.frame_size,
        }
    }

    pub fn reserve(&self) -> &ReservePool {
        &self.reserve
    }

    pub fn deficit(&self) -> u32 {
        self.deficit
    }

    /// Buffers currently posted and not yet taken by the device.
    pub fn ring_occupancy(&self) -> u32 {
        self.ring.occupancy()
    }

    /// Normal allocation first; the reserve after repeated failures or when
    /// the device is almost out of buffers.
    pub fn alloc_or_reserve(&mut self, frames: &FrameAllocator, stats: &SocStats) -> Option<u64> {
        if let Some(addr) = frames.allocate() {
            self.failures = 0;
            return Some(addr);
        }
        self.failures = self.failures.saturating_add(1);

        let low = self.ring.occupancy() < self.low_watermark;
        if self.failures >= self.fail_threshold || low {
            if let Some(addr) = self.reserve.take() {
                bump(&stats.reserve_used);
                return Some(addr);
            }
        }
        bump(&stats.refill_alloc_fail);
        None
    }

    /// Puts a dropped RX buffer into the reserve, or back to the allocator
    /// when the reserve is full.
    pub fn return_to_reserve(&self, addr: u64, frames: &FrameAllocator, stats: &SocStats) {
        let Some(base) = frames.layout().frame_base(addr) else {
            log::warn!("buffer {:#x} outside the buffer region", addr);
            return;
        };
        match self.reserve.give(base) {
            Ok(()) => bump(&stats.reserve_returned),
            Err(base) => frames.release(base),
        }
    }

    /// Tops the reserve up from the general allocator. Returns how many were added.
    pub fn refill_reserve(&self, frames: &FrameAllocator) -> usize {
        let mut added = 0;
        while !self.reserve.is_full() {
            let Some(addr) = frames.allocate() else {
                break;
            };
            if let Err(addr) = self.reserve.give(addr) {
                frames.release(addr);
                break;
            }
            added += 1;
        }
        added
    }

    /// Posts as many buffers as the ring and the pool allow.
    pub fn initial_fill(&mut self, dp: &Datapath) -> Result<u32, FluxError> {
        let count = self.ring.num_free();
        let posted = self.post(dp, count)?;
        log::info!(
            "RX pool {}/{} primed with {} buffers",
            self.chip,
            self.pool,
            posted
        );
        Ok(posted)
    }

    /// Replaces `consumed` buffers plus whatever earlier calls fell short of.
    /// Returns how many were posted.
    pub fn replenish(&mut self, dp: &Datapath, consumed: u32) -> Result<u32, FluxError> {
        let want = consumed.saturating_add(self.deficit).min(self.ring.size());
        let posted = self.post(dp, want)?;
        self.deficit = want - posted;
        if self.deficit > 0 {
            log::debug!(
                "RX pool {}/{}: {} buffers carried to the next pass",
                self.chip,
                self.pool,
                self.deficit
            );
        }
        Ok(posted)
    }

    /// Allocates, maps and posts `count` buffers in bursts, one doorbell per burst.
    fn post(&mut self, dp: &Datapath, count: u32) -> Result<u32, FluxError> {
        let pool = dp
            .rx_pools
            .get(self.chip as usize)
            .and_then(|c| c.get(self.pool as usize))
            .ok_or_else(|| {
                FluxError::InvalidConfiguration(format!("no RX pool {}/{}", self.chip, self.pool))
            })?;

        let mut posted = 0;
        let mut left = count;
        while left > 0 {
            if self.ring.access_start().is_err() {
                bump(&dp.stats.rx_ring_access_fail);
                break;
            }
            let burst = left.min(self.burst).min(self.ring.num_free());
            let res = self.post_burst(dp, pool, burst);
            self.ring.access_end();
            let n = res?;
            posted += n;
            if burst == 0 || n < burst {
                break;
            }
            left -= burst;
        }
        add(&dp.stats.refill_posted, posted as u64);
        if posted < count {
            log::trace!(
                "RX pool {}/{}: posted {} of {} buffers",
                self.chip,
                self.pool,
                posted,
                count
            );
        }
        Ok(posted)
    }

    fn post_burst(
        &mut self,
        dp: &Datapath,
        pool: &Mutex<DescPool<RxBuf>>,
        burst: u32,
    ) -> Result<u32, FluxError> {
        let mut pool = lock(pool, "rx pool")?;
        let ids = pool.allocate_batch(burst as usize);
        if ids.len() < burst as usize {
            bump(&dp.stats.refill_desc_exhausted);
        }

        let mut posted = 0;
        let mut ids = ids.into_iter();
        while let Some(id) = ids.next() {
            let Some(addr) = self.alloc_or_reserve(&dp.frames, &dp.stats) else {
                pool.release(id)?;
                for rest in ids.by_ref() {
                    pool.release(rest)?;
                }
                break;
            };
            let dma = match dp.dma.map(addr, self.frame_size) {
                Ok(dma) => dma,
                Err(e) => {
                    bump(&dp.stats.refill_dma_fail);
                    log::warn!("RX buffer map failed: {}", e);
                    dp.frames.release(addr);
                    pool.release(id)?;
                    continue;
                }
            };

            let Some(desc) = pool.get_mut(id) else {
                dp.dma.unmap(dma, self.frame_size);
                dp.frames.release(addr);
                continue;
            };
            desc.payload = Some(RxBuf { addr, dma });
            desc.set_unmapped(false);
            let cookie = desc.cookie();
            pool.set_state(id, DescState::InFlight);

            let entry = RefillEntry {
                cookie: cookie.raw(),
                chip_id: self.chip,
                pool_id: self.pool,
                _pad: 0,
                buf_dma: dma,
            };
            if self.ring.push(entry).is_err() {
                dp.dma.unmap(dma, self.frame_size);
                dp.frames.release(addr);
                pool.release(id)?;
                for rest in ids.by_ref() {
                    pool.release(rest)?;
                }
                break;
            }
            posted += 1;
        }
        Ok(posted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxpath_core::ring::RingMem;
    use fluxpath_core::umem::UmemLayout;

    fn setup(frames: u32, reserve: u32) -> (Replenisher, FrameAllocator, SocStats) {
        let cfg = DpConfig {
            reserve_size: reserve,
            reserve_fail_threshold: 2,
            reserve_low_watermark_pct: 0,
            ..Default::default()
        };
        let mem = RingMem::<RefillEntry>::new(16).unwrap();
        let rep = Replenisher::new(0, 0, SrcRing::new(mem), &cfg);
        let alloc = FrameAllocator::new(UmemLayout::new(2048, frames).unwrap());
        (rep, alloc, SocStats::default())
    }

    #[test]
    fn test_reserve_used_after_consecutive_failures() {
        let (mut rep, frames, stats) = setup(3, 4);

        // 1. Move every frame into the reserve
        assert_eq!(rep.refill_reserve(&frames), 3);
        assert_eq!(frames.available(), 0);

        // 2. First failure is reported, the second one taps the reserve
        assert!(rep.alloc_or_reserve(&frames, &stats).is_none());
        assert!(rep.alloc_or_reserve(&frames, &stats).is_some());
        let snap = stats.snapshot();
        assert_eq!(snap.refill_alloc_fail, 1);
        assert_eq!(snap.reserve_used, 1);
    }

    #[test]
    fn test_low_ring_taps_reserve_immediately() {
        let cfg = DpConfig {
            reserve_size: 2,
            reserve_fail_threshold: 5,
            reserve_low_watermark_pct: 50,
            ..Default::default()
        };
        let mem = RingMem::<RefillEntry>::new(16).unwrap();
        let mut rep = Replenisher::new(0, 0, SrcRing::new(mem), &cfg);
        let frames = FrameAllocator::new(UmemLayout::new(2048, 1).unwrap());
        let stats = SocStats::default();

        rep.refill_reserve(&frames);
        // Empty refill ring is below the watermark
        assert!(rep.alloc_or_reserve(&frames, &stats).is_some());
        assert_eq!(stats.snapshot().reserve_used, 1);
    }

    #[test]
    fn test_return_to_reserve_caps_at_capacity() {
        let (rep, frames, stats) = setup(4, 1);
        let a = frames.allocate().unwrap();
        let b = frames.allocate().unwrap();

        // Offsets inside the frame are normalised
        rep.return_to_reserve(a + 100, &frames, &stats);
        rep.return_to_reserve(b, &frames, &stats);
        assert_eq!(rep.reserve().len(), 1);
        assert_eq!(rep.reserve().take(), Some(a));
        assert_eq!(frames.available(), 3);
        assert_eq!(stats.snapshot().reserve_returned, 1);
    }

    #[test]
    fn test_disabled_reserve_returns_to_allocator() {
        let (mut rep, frames, stats) = setup(2, 0);
        let a = frames.allocate().unwrap();

        rep.return_to_reserve(a, &frames, &stats);
        assert_eq!(rep.refill_reserve(&frames), 0);
        assert_eq!(rep.reserve().len(), 0);
        assert_eq!(frames.available(), 2);
        assert_eq!(stats.snapshot().reserve_returned, 0);

        // Failures past the threshold find nothing to fall back on
        while frames.allocate().is_some() {}
        assert!(rep.alloc_or_reserve(&frames, &stats).is_none());
        assert!(rep.alloc_or_reserve(&frames, &stats).is_none());
        assert_eq!(stats.snapshot().reserve_used, 0);
    }
}
