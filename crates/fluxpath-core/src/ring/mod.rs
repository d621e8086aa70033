pub mod consumer;
pub mod entry;
pub mod producer;
pub mod region;
pub mod srng;

pub use consumer::ConsumerRing;
pub use entry::{RefillEntry, RxEntry, TxCompEntry, TxEntry};
pub use producer::ProducerRing;
pub use region::RingMem;
pub use srng::{DstRing, SrcRing};
