//! External collaborators the engines call into.

use crate::packet::Packet;
use crate::peer::{PeerId, VdevId};
use crate::stats::{NoTelemetry, Telemetry};
use std::sync::Arc;

/// Receives frames the firmware asked the host to look at.
pub trait Inspector: Send + Sync {
    fn inspect(&self, packet: &Packet, vdev: VdevId, peer: PeerId);
}

/// Replicates a multicast frame over all links of a multi-link device.
pub trait McastFanout: Send + Sync {
    fn fan_out(&self, packet: Packet, vdev: VdevId);
}

/// Hands a frame to the datapath of another chip.
pub trait CrossLink: Send + Sync {
    /// Gives the packet back when the other chip cannot take it.
    fn forward(&self, packet: Packet, dest_chip: u8, vdev: VdevId) -> Result<(), Packet>;
}

/// Stop/resume signal towards the senders of one vdev.
pub trait FlowControl: Send + Sync {
    fn pause(&self, vdev: VdevId);
    fn resume(&self, vdev: VdevId);
}

#[derive(Clone)]
pub struct Hooks {
    pub telemetry: Arc<dyn Telemetry>,
    pub inspector: Option<Arc<dyn Inspector>>,
    pub mcast_fanout: Option<Arc<dyn McastFanout>>,
    pub cross_link: Option<Arc<dyn CrossLink>>,
    pub flow: Option<Arc<dyn FlowControl>>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            telemetry: Arc::new(NoTelemetry),
            inspector: None,
            mcast_fanout: None,
            cross_link: None,
            flow: None,
        }
    }
}
