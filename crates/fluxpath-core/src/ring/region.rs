use crate::error::CoreError;
use crate::ring::{ConsumerRing, ProducerRing};
use memmap2::{MmapMut, MmapOptions};
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// Index words live on separate cache lines, descriptors follow.
const PRODUCER_OFF: usize = 0;
const CONSUMER_OFF: usize = 64;
const STATUS_OFF: usize = 128;
const DESC_OFF: usize = 192;

const STATUS_ERROR: u32 = 1;

/// Shared memory backing one hardware ring.
///
/// Both sides of the ring (host and device) build their view from the same
/// region, so the layout mirrors what a device would expose through BAR space:
/// producer index, consumer index, a status word and the descriptor array.
pub struct RingMem<T> {
    mmap: MmapMut,
    size: u32,
    _marker: PhantomData<T>,
}

unsafe impl<T> Send for RingMem<T> {}
unsafe impl<T> Sync for RingMem<T> {}

impl<T: Copy> RingMem<T> {
    pub fn new(size: u32) -> Result<Arc<Self>, CoreError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(CoreError::InvalidLayout(format!(
                "ring size {} is not a power of two",
                size
            )));
        }

        let len = DESC_OFF + (size as usize) * mem::size_of::<T>();
        let mmap = MmapOptions::new().len(len).map_anon()?;

        Ok(Arc::new(Self {
            mmap,
            size,
            _marker: PhantomData,
        }))
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn status(&self) -> &AtomicU32 {
        unsafe { &*(self.base().add(STATUS_OFF) as *const AtomicU32) }
    }

    /// Latches (or clears) the device-reported error condition.
    pub fn set_error(&self, on: bool) {
        let v = if on { STATUS_ERROR } else { 0 };
        self.status().store(v, Ordering::Release);
    }

    pub fn has_error(&self) -> bool {
        self.status().load(Ordering::Acquire) & STATUS_ERROR != 0
    }

    pub(crate) fn producer_ring(&self) -> ProducerRing<T> {
        unsafe {
            ProducerRing::new(
                self.base().add(PRODUCER_OFF) as *mut u32,
                self.base().add(CONSUMER_OFF) as *mut u32,
                self.base().add(DESC_OFF) as *mut T,
                self.size,
            )
        }
    }

    pub(crate) fn consumer_ring(&self) -> ConsumerRing<T> {
        unsafe {
            ConsumerRing::new(
                self.base().add(PRODUCER_OFF) as *mut u32,
                self.base().add(CONSUMER_OFF) as *mut u32,
                self.base().add(DESC_OFF) as *mut T,
                self.size,
            )
        }
    }
}
