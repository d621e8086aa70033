pub mod deliver;
pub mod reap;

pub use deliver::Delivery;
pub use reap::RxReaper;

use fluxpath_core::DmaAddr;

/// Buffer bound to an RX descriptor while the device owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxBuf {
    pub addr: u64,
    pub dma: DmaAddr,
}
