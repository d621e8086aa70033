pub mod pool;

pub use pool::{DescId, DescPool, DescState, Descriptor, MAGIC_FREE, MAGIC_IN_USE};
