use crate::context::Datapath;
use crate::packet::Packet;
use crate::peer::{Peer, PeerId, PeerRef, Vdev};
use crate::stats::add;
use std::sync::Arc;

/// Host side of the RX path. Must not block.
pub trait Delivery {
    fn deliver(&mut self, batch: Vec<Packet>, vdev: &Vdev, peer: &Peer);
}

impl<F> Delivery for F
where
    F: FnMut(Vec<Packet>, &Vdev, &Peer),
{
    fn deliver(&mut self, batch: Vec<Packet>, vdev: &Vdev, peer: &Peer) {
        self(batch, vdev, peer)
    }
}

struct Run {
    peer: PeerRef,
    vdev: Arc<Vdev>,
    packets: Vec<Packet>,
}

/// Groups consecutive frames of one peer into a single delivery.
///
/// The peer reference is taken when a run starts and dropped when it is
/// flushed.
#[derive(Default)]
pub(crate) struct Batcher {
    run: Option<Run>,
}

impl Batcher {
    /// Makes `peer_id` the current run, flushing the previous one.
    /// False when the peer or its vdev is gone.
    pub(crate) fn switch<D: Delivery>(&mut self, dp: &Datapath, peer_id: PeerId, sink: &mut D) -> bool {
        if self.run.as_ref().map(|r| r.peer.id) == Some(peer_id) {
            return true;
        }
        self.flush(dp, sink);

        let Some(peer) = dp.peers.peer(peer_id) else {
            return false;
        };
        let Some(vdev) = dp.peers.vdev(peer.vdev_id) else {
            return false;
        };
        self.run = Some(Run {
            peer,
            vdev,
            packets: Vec::new(),
        });
        true
    }

    pub(crate) fn peer(&self) -> Option<&Peer> {
        self.run.as_ref().map(|r| &*r.peer)
    }

    pub(crate) fn vdev(&self) -> Option<&Arc<Vdev>> {
        self.run.as_ref().map(|r| &r.vdev)
    }

    pub(crate) fn push(&mut self, packet: Packet) {
        if let Some(run) = self.run.as_mut() {
            run.packets.push(packet);
        }
    }

    pub(crate) fn flush<D: Delivery>(&mut self, dp: &Datapath, sink: &mut D) {
        let Some(run) = self.run.take() else {
            return;
        };
        if run.packets.is_empty() {
            return;
        }
        add(&dp.stats.rx_delivered, run.packets.len() as u64);
        sink.deliver(run.packets, &run.vdev, &run.peer);
    }
}
