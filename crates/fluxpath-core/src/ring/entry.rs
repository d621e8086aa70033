//! Ring entry formats shared by the host and the device.

/// Bits of [`RxEntry::msdu_flags`].
pub mod msdu {
    pub const FIRST_MSDU_IN_MPDU: u16 = 1 << 0;
    pub const LAST_MSDU_IN_MPDU: u16 = 1 << 1;
    /// More buffers of the same MSDU follow.
    pub const CONTINUATION: u16 = 1 << 2;
    pub const DA_IS_VALID: u16 = 1 << 3;
    pub const SA_IS_VALID: u16 = 1 << 4;
    pub const DA_IS_MCBC: u16 = 1 << 5;
}

/// Bits of [`RxEntry::mpdu_flags`].
pub mod mpdu {
    pub const RAW: u16 = 1 << 0;
    pub const RETRY: u16 = 1 << 1;
    pub const FRAGMENT: u16 = 1 << 2;
}

/// Bits of [`RxEntry::host_flags`], owned by the host.
pub mod host {
    /// Set after the host reaped the entry; cleared when it is handed back.
    pub const REAPED: u8 = 1 << 0;
}

/// Entry on an RX destination ring, one per received buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxEntry {
    pub cookie: u32,
    pub buf_dma: u64,
    pub msdu_len: u16,
    pub msdu_flags: u16,
    pub mpdu_flags: u16,
    pub peer_id: u16,
    pub tid: u8,
    /// Chip whose buffer manager owns the buffer.
    pub chip_id: u8,
    pub vdev_id: u8,
    /// Non-zero when the reorder engine reported an error on this ring.
    pub error: u8,
    pub host_flags: u8,
    pub _pad: [u8; 3],
}

impl RxEntry {
    #[inline]
    pub fn is_continuation(&self) -> bool {
        self.msdu_flags & msdu::CONTINUATION != 0
    }

    #[inline]
    pub fn is_reaped(&self) -> bool {
        self.host_flags & host::REAPED != 0
    }
}

/// Entry on a buffer refill ring.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefillEntry {
    pub cookie: u32,
    pub chip_id: u8,
    pub pool_id: u8,
    pub _pad: u16,
    pub buf_dma: u64,
}

/// Bits of [`TxEntry::flags`].
pub mod tx {
    pub const TO_FW: u16 = 1 << 0;
    pub const EXT_DESC: u16 = 1 << 1;
    pub const INTRA_BSS: u16 = 1 << 2;
    pub const MCAST_MLO: u16 = 1 << 3;
    pub const LAST_SEGMENT: u16 = 1 << 4;
}

/// Entry on a TX submit ring.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxEntry {
    pub cookie: u32,
    pub len: u32,
    pub buf_dma: u64,
    /// Cookie of the extension descriptor listing the fragments, when `EXT_DESC` is set.
    pub ext_cookie: u32,
    pub peer_id: u16,
    pub flags: u16,
    pub bank_id: u8,
    pub vdev_id: u8,
    pub tid: u8,
    pub num_frags: u8,
    pub _pad: u32,
}

/// Release source codes carried in [`TxCompEntry::release_src`].
pub mod release_src {
    pub const TQM: u8 = 0;
    pub const RXDMA: u8 = 1;
    pub const REO: u8 = 2;
    pub const FW: u8 = 3;
    pub const SW: u8 = 4;
}

/// Upper 32 bits written into [`TxCompEntry::desc_va`] once the host reaped it.
pub const DESC_VA_INVALIDATED: u32 = 0x1212_1212;

/// Entry on a TX completion ring.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxCompEntry {
    pub cookie: u32,
    pub release_src: u8,
    /// TQM release reason or firmware status, depending on `release_src`.
    pub status: u8,
    pub reinject_reason: u8,
    /// Non-zero when the device already converted the cookie into `desc_va`.
    pub cc_done: u8,
    pub desc_va: u64,
    pub buf_dma: u64,
    pub peer_id: u16,
    pub tid: u8,
    pub _pad: [u8; 5],
}

impl TxCompEntry {
    #[inline]
    pub fn desc_va_hi(&self) -> u32 {
        (self.desc_va >> 32) as u32
    }

    /// Marks the entry as reaped so a replayed entry is recognised as stale.
    #[inline]
    pub fn invalidate(&mut self) {
        self.desc_va = ((DESC_VA_INVALIDATED as u64) << 32) | (self.desc_va & 0xFFFF_FFFF);
    }
}
