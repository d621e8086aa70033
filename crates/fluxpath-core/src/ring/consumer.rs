use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

pub struct ConsumerRing<T> {
    producer: *const AtomicU32,
    consumer: *mut AtomicU32,
    descriptors: *mut T,
    mask: u32,
    size: u32,
}

unsafe impl<T> Send for ConsumerRing<T> {}

impl<T: Copy> ConsumerRing<T> {
    /// # Safety
    /// Pointers must be valid for the lifetime of the ring and `size` must be a power of two.
    pub unsafe fn new(
        producer: *mut u32,
        consumer: *mut u32,
        descriptors: *mut T,
        size: u32,
    ) -> Self {
        Self {
            producer: producer as *const AtomicU32,
            consumer: consumer as *mut AtomicU32,
            descriptors,
            mask: size - 1,
            size,
        }
    }

    #[inline]
    pub fn peek(&mut self, count: u32) -> usize {
        let available = self.producer_idx().wrapping_sub(self.consumer_idx());
        if available == 0 {
            return 0;
        }
        std::cmp::min(available as usize, count as usize)
    }

    #[inline]
    pub fn release(&mut self, count: u32) {
        let current = self.consumer_idx();
        self.set_consumer(current.wrapping_add(count));
    }

    /// Publishes an absolute consumer index.
    #[inline]
    pub fn set_consumer(&mut self, idx: u32) {
        unsafe { (*self.consumer).store(idx, Ordering::Release) };
    }

    /// # Safety
    /// `idx` must refer to an entry already published by the producer.
    #[inline]
    pub unsafe fn read_at(&self, idx: u32) -> T {
        let offset = (idx & self.mask) as usize;
        ptr::read(self.descriptors.add(offset))
    }

    /// Writes back into an entry the consumer still owns (e.g. to mark it reaped).
    ///
    /// # Safety
    /// `idx` must be between the consumer index and the producer index.
    #[inline]
    pub unsafe fn write_at(&mut self, idx: u32, item: T) {
        let offset = (idx & self.mask) as usize;
        ptr::write(self.descriptors.add(offset), item);
    }

    #[inline]
    pub fn consumer_idx(&self) -> u32 {
        unsafe { (*self.consumer).load(Ordering::Relaxed) }
    }

    #[inline]
    pub fn producer_idx(&self) -> u32 {
        unsafe { (*self.producer).load(Ordering::Acquire) }
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.size
    }
}
