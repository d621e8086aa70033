pub mod cookie;
pub mod desc;
pub mod dma;
pub mod error;
pub mod ring;
pub mod rx_tlv;
pub mod umem;

pub use cookie::{Cookie, PageTable, PoolId, PoolKind};
pub use desc::{DescId, DescPool, DescState};
pub use dma::{DmaAddr, DmaMapper, UmemDma};
pub use error::CoreError;
