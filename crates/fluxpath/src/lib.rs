pub mod builder;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod forward;
pub mod hooks;
pub mod packet;
pub mod peer;
pub mod replenish;
pub mod rx;
pub mod sink;
pub mod stats;
pub mod tx;

#[cfg(feature = "simulator")]
pub mod simulator;

pub use builder::{DatapathBuilder, DeviceRings, DpParts};
pub use config::{CookieMode, DpConfig, Poller};
pub use context::Datapath;
pub use engine::DpEngine;
pub use error::{ErrorClass, FluxError};
pub use forward::FwdDecision;
pub use packet::{Packet, PacketMeta};
pub use peer::{Peer, PeerDirectory, PeerId, PeerTable, Vdev, VdevId};
pub use rx::{Delivery, RxReaper};
pub use stats::{StatsSnapshot, Telemetry};
pub use tx::{BankConfig, TxCompletion, TxOutcome, TxParams, TxReject};
