use crate::error::CoreError;
use crate::umem::layout::UmemLayout;
use memmap2::{MmapMut, MmapOptions};
use std::ptr;
use std::slice;

/// Anonymous memory region carved into fixed-size buffers.
pub struct UmemRegion {
    mmap: MmapMut,
    layout: UmemLayout,
}

unsafe impl Send for UmemRegion {}
unsafe impl Sync for UmemRegion {}

impl UmemRegion {
    pub fn new(layout: UmemLayout) -> Result<Self, CoreError> {
        let len = layout.size();
        let mmap = MmapOptions::new().len(len).map_anon()?;

        Ok(Self { mmap, layout })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn layout(&self) -> UmemLayout {
        self.layout
    }

    #[inline]
    fn in_bounds(&self, addr: u64, len: usize) -> bool {
        (addr as usize)
            .checked_add(len)
            .map(|end| end <= self.len())
            .unwrap_or(false)
    }

    /// Borrows `len` bytes at `addr`.
    pub fn slice(&self, addr: u64, len: usize) -> Option<&[u8]> {
        if !self.in_bounds(addr, len) {
            return None;
        }
        unsafe {
            let ptr = self.as_ptr().add(addr as usize);
            Some(slice::from_raw_parts(ptr, len))
        }
    }

    /// # Safety
    /// The caller must own the frame(s) covered by the range and no other
    /// reference to them may be alive.
    pub unsafe fn slice_mut(&self, addr: u64, len: usize) -> Option<&mut [u8]> {
        if !self.in_bounds(addr, len) {
            return None;
        }
        let ptr = self.as_ptr().add(addr as usize);
        Some(slice::from_raw_parts_mut(ptr, len))
    }

    /// Copies `data` into the region.
    ///
    /// # Safety
    /// Same ownership rules as [`UmemRegion::slice_mut`].
    pub unsafe fn write(&self, addr: u64, data: &[u8]) -> Result<(), CoreError> {
        if !self.in_bounds(addr, data.len()) {
            return Err(CoreError::InvalidLayout(format!(
                "write of {} bytes at {:#x} outside region",
                data.len(),
                addr
            )));
        }
        ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(addr as usize), data.len());
        Ok(())
    }
}
