pub mod allocator;
pub mod layout;
pub mod region;

pub use allocator::FrameAllocator;
pub use layout::UmemLayout;
pub use region::UmemRegion;
