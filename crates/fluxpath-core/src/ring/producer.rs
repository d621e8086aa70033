use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Host-written end of a ring in shared memory.
///
/// The host owns the head (producer) index; the device advances the tail
/// (consumer) index as it takes entries. Refill and TX rings are driven
/// through this type; the device model also uses it to post RX and
/// completion entries.
pub struct ProducerRing<T> {
    head: *mut AtomicU32,
    tail: *const AtomicU32,
    entries: *mut T,
    mask: u32,
    size: u32,
}

unsafe impl<T> Send for ProducerRing<T> {}

impl<T: Copy> ProducerRing<T> {
    /// # Safety
    /// `head`, `tail` and `entries` must stay valid while the ring lives and
    /// `size` must be a power of two.
    pub unsafe fn new(head: *mut u32, tail: *mut u32, entries: *mut T, size: u32) -> Self {
        Self {
            head: head as *mut AtomicU32,
            tail: tail as *const AtomicU32,
            entries,
            mask: size - 1,
            size,
        }
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn producer_idx(&self) -> u32 {
        unsafe { (*self.head).load(Ordering::Relaxed) }
    }

    #[inline]
    pub fn consumer_idx(&self) -> u32 {
        unsafe { (*self.tail).load(Ordering::Acquire) }
    }

    /// Slots between the published head and the device's tail.
    #[inline]
    pub fn free_slots(&self) -> u32 {
        self.size - self.producer_idx().wrapping_sub(self.consumer_idx())
    }

    /// Start index of `count` free slots, if there are that many.
    pub fn claim(&self, count: u32) -> Option<u32> {
        (self.free_slots() >= count).then(|| self.producer_idx())
    }

    /// Makes every slot before `idx` visible to the device.
    #[inline]
    pub fn publish(&mut self, idx: u32) {
        unsafe { (*self.head).store(idx, Ordering::Release) };
    }

    /// # Safety
    /// `idx` must be a slot obtained from `claim` and not published yet.
    #[inline]
    pub unsafe fn write_slot(&mut self, idx: u32, entry: T) {
        ptr::write(self.entries.add((idx & self.mask) as usize), entry);
    }
}
