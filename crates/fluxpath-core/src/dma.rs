use crate::error::CoreError;
use std::sync::atomic::{AtomicUsize, Ordering};

pub type DmaAddr = u64;

/// Maps host buffers into device-visible addresses.
pub trait DmaMapper: Send + Sync {
    fn map(&self, addr: u64, len: u32) -> Result<DmaAddr, CoreError>;
    fn unmap(&self, dma: DmaAddr, len: u32);

    /// Host address behind a device address. Only device models need this.
    fn host_addr(&self, _dma: DmaAddr) -> Option<u64> {
        None
    }
}

/// Identity-plus-offset mapper for a UMEM region.
///
/// Tracks live mappings, and can be told to fail the n-th upcoming map so
/// unwind paths can be exercised.
pub struct UmemDma {
    base: u64,
    live: AtomicUsize,
    fail_countdown: AtomicUsize,
}

impl UmemDma {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            live: AtomicUsize::new(0),
            fail_countdown: AtomicUsize::new(0),
        }
    }

    pub fn live_mappings(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Makes the `n`-th map call from now fail (1 = the next one). 0 disarms.
    pub fn fail_nth(&self, n: usize) {
        self.fail_countdown.store(n, Ordering::Release);
    }

    pub fn to_addr(&self, dma: DmaAddr) -> u64 {
        dma.wrapping_sub(self.base)
    }
}

impl DmaMapper for UmemDma {
    fn map(&self, addr: u64, _len: u32) -> Result<DmaAddr, CoreError> {
        let armed = self
            .fail_countdown
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        if armed == Ok(1) {
            return Err(CoreError::DmaMap(addr));
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(self.base + addr)
    }

    fn unmap(&self, dma: DmaAddr, _len: u32) {
        let prev = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        if prev.is_err() {
            log::error!("unmap of {:#x} without a live mapping", dma);
        }
    }

    fn host_addr(&self, dma: DmaAddr) -> Option<u64> {
        dma.checked_sub(self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_unmap_counts() {
        let dma = UmemDma::new(0x1000_0000);
        let a = dma.map(0x800, 64).unwrap();
        assert_eq!(a, 0x1000_0800);
        assert_eq!(dma.to_addr(a), 0x800);
        assert_eq!(dma.live_mappings(), 1);
        dma.unmap(a, 64);
        assert_eq!(dma.live_mappings(), 0);
        // Spurious unmap does not underflow
        dma.unmap(a, 64);
        assert_eq!(dma.live_mappings(), 0);
    }

    #[test]
    fn test_fail_injection() {
        let dma = UmemDma::new(0);
        dma.fail_nth(2);
        assert!(dma.map(0, 1).is_ok());
        assert!(dma.map(0, 1).is_err());
        assert!(dma.map(0, 1).is_ok());
        assert_eq!(dma.live_mappings(), 2);
    }
}
