pub mod admission;
pub mod bank;
pub mod completion;
pub mod enqueue;
pub mod status;

pub use admission::{Admission, Flow, VdevCounter};
pub use bank::{BankConfig, BankTable};
pub use completion::TxCompletion;
pub use status::{TqmReason, TxOutcome};

use crate::error::FluxError;
use crate::packet::Packet;
use crate::peer::{PeerId, VdevId};
use fluxpath_core::{DescId, DmaAddr};

/// Host-only bits of [`TxBuf::flags`].
pub mod flags {
    pub const TO_FW: u16 = 1 << 0;
    /// Single-buffer frame, no extension descriptor.
    pub const SIMPLE: u16 = 1 << 1;
    pub const REINJECT: u16 = 1 << 2;
    /// Admitted through the control-plane allowance.
    pub const SPECIAL: u16 = 1 << 3;
    pub const INTRA_BSS: u16 = 1 << 4;
    pub const MCAST_MLO: u16 = 1 << 5;
    /// Buffer already dropped by vdev teardown; only the descriptor is left.
    pub const FLUSHED: u16 = 1 << 6;
}

/// Payload of a TX descriptor while the frame is owned by the device.
#[derive(Debug)]
pub struct TxBuf {
    pub packet: Option<Packet>,
    /// Live mappings, one per fragment.
    pub dma: Vec<(DmaAddr, u32)>,
    pub ext: Option<DescId>,
    pub vdev_id: VdevId,
    /// Vdev whose admission count this descriptor holds.
    pub counted_vdev: Option<VdevId>,
    pub peer_id: PeerId,
    pub tid: u8,
    pub flags: u16,
    pub len: u32,
}

/// Fragment list the device reads for scatter/gather and segments.
#[derive(Debug, Default)]
pub struct ExtDesc {
    pub frags: Vec<(DmaAddr, u32)>,
}

/// Per-submission metadata.
#[derive(Debug, Clone, Copy)]
pub struct TxParams {
    pub vdev_id: VdevId,
    pub tid: u8,
    /// Submitting CPU or queue; picks the descriptor pool and ring.
    pub queue: u32,
    /// Overrides the peer the device looks up (exception path).
    pub peer_id: Option<PeerId>,
    pub intra_bss: bool,
    pub mcast_mlo: bool,
    pub to_fw: bool,
    pub reinject: bool,
    /// Ring the doorbell right away even when coalescing.
    pub flush: bool,
}

impl TxParams {
    pub fn new(vdev_id: VdevId) -> Self {
        Self {
            vdev_id,
            tid: 0,
            queue: 0,
            peer_id: None,
            intra_bss: false,
            mcast_mlo: false,
            to_fw: false,
            reinject: false,
            flush: false,
        }
    }

    pub fn tid(mut self, tid: u8) -> Self {
        self.tid = tid;
        self
    }

    pub fn queue(mut self, queue: u32) -> Self {
        self.queue = queue;
        self
    }

    pub fn peer(mut self, peer: PeerId) -> Self {
        self.peer_id = Some(peer);
        self
    }

    pub fn intra_bss(mut self) -> Self {
        self.intra_bss = true;
        self
    }

    pub fn mcast_mlo(mut self) -> Self {
        self.mcast_mlo = true;
        self
    }

    pub fn to_fw(mut self) -> Self {
        self.to_fw = true;
        self
    }

    pub fn reinject(mut self) -> Self {
        self.reinject = true;
        self
    }

    pub fn flush(mut self) -> Self {
        self.flush = true;
        self
    }
}

/// A submission the datapath did not take. The frames are handed back.
#[derive(Debug)]
pub struct TxReject {
    pub error: FluxError,
    pub packets: Vec<Packet>,
}

impl TxReject {
    pub(crate) fn new(error: FluxError, packets: Vec<Packet>) -> Self {
        Self { error, packets }
    }

    pub fn into_error(self) -> FluxError {
        self.error
    }
}

impl std::fmt::Display for TxReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} frames returned)", self.error, self.packets.len())
    }
}

impl std::error::Error for TxReject {}
