//! Cookies: the only handle the device ever sees for a software descriptor.
//!
//! A cookie packs a secondary page-table slot (bits 0..9) and a primary
//! page-table index (bits 9..20). Each chip owns one primary page table;
//! contiguous page ranges are handed to descriptor pools when they are
//! created, so a (chip, cookie) pair always names exactly one pool slot.

use crate::error::CoreError;
use std::fmt;

pub const SLOT_BITS: u32 = 9;
pub const SLOTS_PER_PAGE: u32 = 1 << SLOT_BITS;
pub const PAGE_BITS: u32 = 11;
pub const MAX_PAGES: u32 = 1 << PAGE_BITS;

const SLOT_MASK: u32 = SLOTS_PER_PAGE - 1;
const PAGE_MASK: u32 = MAX_PAGES - 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cookie(u32);

impl Cookie {
    #[inline]
    pub const fn new(page: u32, slot: u32) -> Self {
        Cookie(((page & PAGE_MASK) << SLOT_BITS) | (slot & SLOT_MASK))
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Cookie(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn page(self) -> u32 {
        (self.0 >> SLOT_BITS) & PAGE_MASK
    }

    #[inline]
    pub const fn slot(self) -> u32 {
        self.0 & SLOT_MASK
    }

    /// Bits above the page field must be clear.
    #[inline]
    pub const fn is_well_formed(self) -> bool {
        self.0 >> (SLOT_BITS + PAGE_BITS) == 0
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({:#x}: page {} slot {})", self.0, self.page(), self.slot())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Rx,
    Tx,
    TxExt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId {
    pub chip: u8,
    pub kind: PoolKind,
    pub index: u8,
}

impl PoolId {
    pub const fn new(chip: u8, kind: PoolKind, index: u8) -> Self {
        Self { chip, kind, index }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[chip {} pool {}]", self.kind, self.chip, self.index)
    }
}

/// Primary page table of one chip.
#[derive(Debug)]
pub struct PageTable {
    chip: u8,
    owners: Vec<Option<PoolId>>,
    next: u32,
}

impl PageTable {
    pub fn new(chip: u8, max_pages: u32) -> Self {
        let max_pages = max_pages.clamp(2, MAX_PAGES);
        Self {
            chip,
            owners: vec![None; max_pages as usize],
            // Page 0 is never handed out, so an all-zero ring entry cannot
            // resolve to a live descriptor.
            next: 1,
        }
    }

    pub fn chip(&self) -> u8 {
        self.chip
    }

    pub fn pages_for(slots: u32) -> u32 {
        slots.div_ceil(SLOTS_PER_PAGE)
    }

    /// Reserves enough consecutive pages for `slots` descriptors. Returns the first page.
    pub fn reserve(&mut self, pool: PoolId, slots: u32) -> Result<u32, CoreError> {
        let pages = Self::pages_for(slots).max(1);
        let end = self.next + pages;
        if end as usize > self.owners.len() {
            return Err(CoreError::PageTableFull(pages));
        }
        for page in self.next..end {
            self.owners[page as usize] = Some(pool);
        }
        let base = self.next;
        self.next = end;
        Ok(base)
    }

    pub fn owner(&self, page: u32) -> Option<PoolId> {
        self.owners.get(page as usize).copied().flatten()
    }

    pub fn resolve(&self, cookie: Cookie) -> Option<PoolId> {
        if !cookie.is_well_formed() {
            return None;
        }
        self.owner(cookie.page())
    }
}
