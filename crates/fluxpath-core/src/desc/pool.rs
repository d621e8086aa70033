use crate::cookie::{Cookie, PoolId, SLOTS_PER_PAGE};
use crate::error::CoreError;
use std::collections::VecDeque;

pub const MAGIC_IN_USE: u32 = 0xABCD_1234;
pub const MAGIC_FREE: u32 = 0xDEAD_BEEF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescState {
    Free,
    /// Handed out, not yet visible to the device.
    Allocated,
    /// Owned by the device.
    InFlight,
    /// Returned by the device, waiting for release.
    Completed,
}

/// Index of a descriptor inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescId(pub u32);

#[derive(Debug)]
pub struct Descriptor<T> {
    cookie: Cookie,
    state: DescState,
    magic: u32,
    unmapped: bool,
    pub payload: Option<T>,
}

impl<T> Descriptor<T> {
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    pub fn state(&self) -> DescState {
        self.state
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn is_in_use(&self) -> bool {
        self.state != DescState::Free && self.magic == MAGIC_IN_USE
    }

    /// True once the buffer's DMA mapping has been torn down.
    pub fn is_unmapped(&self) -> bool {
        self.unmapped
    }

    pub fn set_unmapped(&mut self, unmapped: bool) {
        self.unmapped = unmapped;
    }
}

/// Fixed-capacity descriptor arena with a FIFO free list.
///
/// All descriptors and their cookies are created up front; afterwards only
/// their occupancy changes.
pub struct DescPool<T> {
    id: PoolId,
    base_page: u32,
    descs: Vec<Descriptor<T>>,
    free: VecDeque<u32>,
}

impl<T> DescPool<T> {
    pub fn new(id: PoolId, capacity: u32, base_page: u32) -> Self {
        let mut descs = Vec::with_capacity(capacity as usize);
        let mut free = VecDeque::with_capacity(capacity as usize);
        for i in 0..capacity {
            let page = base_page + i / SLOTS_PER_PAGE;
            descs.push(Descriptor {
                cookie: Cookie::new(page, i % SLOTS_PER_PAGE),
                state: DescState::Free,
                magic: MAGIC_FREE,
                unmapped: true,
                payload: None,
            });
            free.push_back(i);
        }

        Self {
            id,
            base_page,
            descs,
            free,
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.descs.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.descs.len() - self.free.len()
    }

    pub fn allocate(&mut self) -> Result<DescId, CoreError> {
        let idx = self
            .free
            .pop_front()
            .ok_or_else(|| CoreError::Exhausted(self.id.to_string()))?;
        let desc = &mut self.descs[idx as usize];
        desc.state = DescState::Allocated;
        desc.magic = MAGIC_IN_USE;
        desc.unmapped = true;
        Ok(DescId(idx))
    }

    /// Allocates up to `n` descriptors; fewer when the pool runs dry.
    pub fn allocate_batch(&mut self, n: usize) -> Vec<DescId> {
        let mut out = Vec::with_capacity(n.min(self.free.len()));
        while out.len() < n {
            match self.allocate() {
                Ok(id) => out.push(id),
                Err(_) => break,
            }
        }
        out
    }

    pub fn get(&self, id: DescId) -> Option<&Descriptor<T>> {
        self.descs.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: DescId) -> Option<&mut Descriptor<T>> {
        self.descs.get_mut(id.0 as usize)
    }

    pub fn cookie(&self, id: DescId) -> Option<Cookie> {
        self.get(id).map(|d| d.cookie)
    }

    pub fn set_state(&mut self, id: DescId, state: DescState) {
        if let Some(desc) = self.descs.get_mut(id.0 as usize) {
            if desc.state != DescState::Free {
                desc.state = state;
            }
        }
    }

    /// Returns the descriptor to the free list and hands back its payload.
    pub fn release(&mut self, id: DescId) -> Result<Option<T>, CoreError> {
        let desc = self
            .descs
            .get_mut(id.0 as usize)
            .ok_or(CoreError::InvalidCookie(Cookie::default()))?;
        if desc.state == DescState::Free || desc.magic != MAGIC_IN_USE {
            return Err(CoreError::DoubleRelease(desc.cookie));
        }
        desc.state = DescState::Free;
        desc.magic = MAGIC_FREE;
        let payload = desc.payload.take();
        self.free.push_back(id.0);
        Ok(payload)
    }

    /// Slot addressed by the cookie, whatever its state.
    pub fn locate(&self, cookie: Cookie) -> Option<DescId> {
        let page = cookie.page();
        if page < self.base_page {
            return None;
        }
        let idx = (page - self.base_page) * SLOTS_PER_PAGE + cookie.slot();
        if (idx as usize) < self.descs.len() {
            Some(DescId(idx))
        } else {
            None
        }
    }

    /// Resolves a device-supplied cookie to a live descriptor.
    pub fn resolve(&self, cookie: Cookie) -> Result<DescId, CoreError> {
        let id = self.locate(cookie).ok_or(CoreError::InvalidCookie(cookie))?;
        let desc = &self.descs[id.0 as usize];
        if !desc.is_in_use() {
            return Err(CoreError::StaleCookie(cookie));
        }
        Ok(id)
    }

    /// Visits every descriptor that is currently in use.
    pub fn walk_in_use<F>(&mut self, mut f: F)
    where
        F: FnMut(DescId, &mut Descriptor<T>),
    {
        for (i, desc) in self.descs.iter_mut().enumerate() {
            if desc.is_in_use() {
                f(DescId(i as u32), desc);
            }
        }
    }
}
