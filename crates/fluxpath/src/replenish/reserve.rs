use crossbeam_queue::ArrayQueue;

/// Bounded stash of RX buffers kept back for allocation pressure.
///
/// Capacity is fixed at construction, so the stash can never grow past it.
/// A capacity of zero disables the reserve.
pub struct ReservePool {
    bufs: Option<ArrayQueue<u64>>,
}

impl ReservePool {
    pub fn new(capacity: u32) -> Self {
        Self {
            bufs: (capacity > 0).then(|| ArrayQueue::new(capacity as usize)),
        }
    }

    pub fn take(&self) -> Option<u64> {
        self.bufs.as_ref()?.pop()
    }

    /// Stashes `addr`; hands it back when the reserve is already full.
    pub fn give(&self, addr: u64) -> Result<(), u64> {
        match &self.bufs {
            Some(bufs) => bufs.push(addr),
            None => Err(addr),
        }
    }

    pub fn len(&self) -> usize {
        self.bufs.as_ref().map_or(0, |b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.bufs.as_ref().map_or(true, |b| b.is_full())
    }

    pub fn capacity(&self) -> usize {
        self.bufs.as_ref().map_or(0, |b| b.capacity())
    }
}
