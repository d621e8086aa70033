//! Completion status decoding.

use fluxpath_core::ring::entry::{release_src, TxCompEntry};

/// Release reasons reported by the queue manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TqmReason {
    Acked = 0,
    RemCmdRem = 1,
    /// Removed after transmit attempts; firmware TTL expiry lands here.
    RemCmdTx = 2,
    RemCmdNotx = 3,
    RemCmdAged = 4,
    FwReason1 = 5,
    FwReason2 = 6,
    FwReason3 = 7,
    DisableQueue = 8,
    TillNonmatching = 9,
    DropThreshold = 10,
    LinkDescUnavailable = 11,
    DropOrInvalidMsdu = 12,
    MulticastDrop = 13,
}

impl TqmReason {
    pub fn from_code(code: u8) -> Option<Self> {
        use TqmReason::*;
        Some(match code {
            0 => Acked,
            1 => RemCmdRem,
            2 => RemCmdTx,
            3 => RemCmdNotx,
            4 => RemCmdAged,
            5 => FwReason1,
            6 => FwReason2,
            7 => FwReason3,
            8 => DisableQueue,
            9 => TillNonmatching,
            10 => DropThreshold,
            11 => LinkDescUnavailable,
            12 => DropOrInvalidMsdu,
            13 => MulticastDrop,
            _ => return None,
        })
    }
}

/// Firmware status codes, valid when the release source is the firmware.
pub mod fw_status {
    pub const OK: u8 = 0;
    pub const DROP: u8 = 1;
    pub const TTL: u8 = 2;
    pub const REINJECT: u8 = 3;
    pub const INSPECT: u8 = 4;
    pub const VDEV_ID_MISMATCH: u8 = 5;
    pub const MEC_NOTIFY: u8 = 6;
}

/// Reinject reason asking for multi-link multicast replication.
pub const REINJECT_MLO_MCAST: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseSource {
    Tqm,
    Fw,
    Other(u8),
}

impl ReleaseSource {
    pub fn from_code(code: u8) -> Self {
        match code {
            release_src::TQM => ReleaseSource::Tqm,
            release_src::FW => ReleaseSource::Fw,
            other => ReleaseSource::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReinjectReason {
    MloMcast,
    Other(u8),
}

/// What the device did with a transmitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Acked,
    Dropped(TqmReason),
    Reinject(ReinjectReason),
    Inspect,
    VdevMismatch,
    MecNotify,
    /// Status code this host does not know.
    Unknown(u8),
}

impl TxOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TxOutcome::Acked)
    }
}

pub fn decode(entry: &TxCompEntry) -> TxOutcome {
    match ReleaseSource::from_code(entry.release_src) {
        ReleaseSource::Tqm => match TqmReason::from_code(entry.status) {
            Some(TqmReason::Acked) => TxOutcome::Acked,
            Some(reason) => TxOutcome::Dropped(reason),
            None => TxOutcome::Unknown(entry.status),
        },
        ReleaseSource::Fw => match entry.status {
            fw_status::OK => TxOutcome::Acked,
            fw_status::DROP => TxOutcome::Dropped(TqmReason::RemCmdRem),
            fw_status::TTL => TxOutcome::Dropped(TqmReason::RemCmdTx),
            fw_status::REINJECT => {
                if entry.reinject_reason == REINJECT_MLO_MCAST {
                    TxOutcome::Reinject(ReinjectReason::MloMcast)
                } else {
                    TxOutcome::Reinject(ReinjectReason::Other(entry.reinject_reason))
                }
            }
            fw_status::INSPECT => TxOutcome::Inspect,
            fw_status::VDEV_ID_MISMATCH => TxOutcome::VdevMismatch,
            fw_status::MEC_NOTIFY => TxOutcome::MecNotify,
            other => TxOutcome::Unknown(other),
        },
        ReleaseSource::Other(_) => TxOutcome::Unknown(entry.status),
    }
}
