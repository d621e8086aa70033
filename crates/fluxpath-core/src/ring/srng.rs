use crate::error::CoreError;
use crate::ring::region::RingMem;
use crate::ring::{ConsumerRing, ProducerRing};
use std::sync::Arc;

/// Consuming side of a ring ("destination" ring from the host's point of view).
///
/// Entries are reaped between `access_start` and `access_end`. The consumer
/// index is only published in `access_end`, which lets the reaper give back
/// entries it already looked at with `dec_tail`.
pub struct DstRing<T> {
    ring: ConsumerRing<T>,
    mem: Arc<RingMem<T>>,
    tp: u32,
    hp: u32,
    in_access: bool,
    near_full_threshold: u32,
}

impl<T: Copy> DstRing<T> {
    pub fn new(mem: Arc<RingMem<T>>) -> Self {
        let ring = mem.consumer_ring();
        let hp = ring.consumer_idx();
        let size = mem.size();
        Self {
            ring,
            mem,
            tp: hp,
            hp,
            in_access: false,
            // 3/4 full by default
            near_full_threshold: size - size / 4,
        }
    }

    pub fn with_near_full(mut self, threshold: u32) -> Self {
        self.near_full_threshold = threshold.min(self.mem.size());
        self
    }

    pub fn access_start(&mut self) -> Result<(), CoreError> {
        if self.mem.has_error() {
            return Err(CoreError::RingAccess("device reported ring error"));
        }
        if self.in_access {
            return Err(CoreError::RingAccess("access already started"));
        }
        self.hp = self.ring.consumer_idx();
        self.tp = self.ring.producer_idx();
        self.in_access = true;
        Ok(())
    }

    /// Entries visible since `access_start` that have not been reaped yet.
    #[inline]
    pub fn num_valid(&self) -> u32 {
        self.tp.wrapping_sub(self.hp)
    }

    /// Re-reads the producer index without leaving the access window.
    pub fn refresh(&mut self) -> u32 {
        self.tp = self.ring.producer_idx();
        self.num_valid()
    }

    #[inline]
    pub fn next(&mut self) -> Option<T> {
        if self.hp == self.tp {
            return None;
        }
        let entry = unsafe { self.ring.read_at(self.hp) };
        self.hp = self.hp.wrapping_add(1);
        Some(entry)
    }

    /// Overwrites the entry most recently returned by `next`.
    pub fn rewrite_last(&mut self, entry: T) {
        let idx = self.hp.wrapping_sub(1);
        unsafe { self.ring.write_at(idx, entry) };
    }

    /// Hands the last reaped entry back to the ring so the next pass sees it again.
    pub fn dec_tail(&mut self) {
        if self.hp != self.ring.consumer_idx() {
            self.hp = self.hp.wrapping_sub(1);
        }
    }

    pub fn access_end(&mut self) {
        self.ring.set_consumer(self.hp);
        self.in_access = false;
    }

    /// Occupancy as seen by the published indices.
    pub fn pending(&self) -> u32 {
        self.ring.producer_idx().wrapping_sub(self.ring.consumer_idx())
    }

    pub fn near_full(&self) -> bool {
        self.pending() >= self.near_full_threshold
    }

    pub fn size(&self) -> u32 {
        self.mem.size()
    }
}

/// Producing side of a ring ("source" ring from the host's point of view).
///
/// `push` only writes into the local head; the producer index (the doorbell)
/// is published by `access_end` or later by `flush`, which is how submissions
/// are coalesced.
pub struct SrcRing<T> {
    ring: ProducerRing<T>,
    mem: Arc<RingMem<T>>,
    hp: u32,
    in_access: bool,
}

impl<T: Copy> SrcRing<T> {
    pub fn new(mem: Arc<RingMem<T>>) -> Self {
        let ring = mem.producer_ring();
        let hp = ring.producer_idx();
        Self {
            ring,
            mem,
            hp,
            in_access: false,
        }
    }

    pub fn access_start(&mut self) -> Result<(), CoreError> {
        if self.mem.has_error() {
            return Err(CoreError::RingAccess("device reported ring error"));
        }
        if self.in_access {
            return Err(CoreError::RingAccess("access already started"));
        }
        self.in_access = true;
        Ok(())
    }

    #[inline]
    pub fn num_free(&self) -> u32 {
        self.ring.size() - self.hp.wrapping_sub(self.ring.consumer_idx())
    }

    pub fn push(&mut self, entry: T) -> Result<(), CoreError> {
        if self.num_free() == 0 {
            return Err(CoreError::RingFull);
        }
        unsafe { self.ring.write_slot(self.hp, entry) };
        self.hp = self.hp.wrapping_add(1);
        Ok(())
    }

    /// Ends access and rings the doorbell.
    pub fn access_end(&mut self) -> u32 {
        self.in_access = false;
        self.flush()
    }

    /// Ends access but leaves pushed entries unpublished.
    pub fn access_end_deferred(&mut self) {
        self.in_access = false;
    }

    /// Entries written locally but not yet visible to the consumer.
    #[inline]
    pub fn pending(&self) -> u32 {
        self.hp.wrapping_sub(self.ring.producer_idx())
    }

    /// Publishes the local head. Returns how many entries became visible.
    pub fn flush(&mut self) -> u32 {
        let pending = self.pending();
        if pending > 0 {
            self.ring.publish(self.hp);
        }
        pending
    }

    /// Entries published and not yet consumed on the other side.
    pub fn occupancy(&self) -> u32 {
        self.ring.producer_idx().wrapping_sub(self.ring.consumer_idx())
    }

    pub fn size(&self) -> u32 {
        self.mem.size()
    }
}
