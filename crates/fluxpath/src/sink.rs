//! Ready-made [`Delivery`] implementations.

use crate::packet::Packet;
use crate::peer::{Peer, PeerId, Vdev, VdevId};
use crate::rx::Delivery;

/// One delivery call.
#[derive(Debug)]
pub struct Delivered {
    pub vdev: VdevId,
    pub peer: PeerId,
    pub packets: Vec<Packet>,
}

/// Keeps every batch in memory.
#[derive(Debug, Default)]
pub struct CollectSink {
    pub batches: Vec<Delivered>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets(&self) -> usize {
        self.batches.iter().map(|b| b.packets.len()).sum()
    }

    pub fn take(&mut self) -> Vec<Delivered> {
        std::mem::take(&mut self.batches)
    }
}

impl Delivery for CollectSink {
    fn deliver(&mut self, batch: Vec<Packet>, vdev: &Vdev, peer: &Peer) {
        self.batches.push(Delivered {
            vdev: vdev.id,
            peer: peer.id,
            packets: batch,
        });
    }
}

#[cfg(feature = "async")]
pub use self::channel::{channel, AsyncSink};

#[cfg(feature = "async")]
mod channel {
    use super::Delivered;
    use crate::packet::Packet;
    use crate::peer::{Peer, Vdev};
    use crate::rx::Delivery;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Forwards batches to an async consumer. A full channel drops the batch.
    pub struct AsyncSink {
        tx: mpsc::Sender<Delivered>,
        dropped: Arc<AtomicU64>,
    }

    impl AsyncSink {
        /// Packets lost to a full or closed channel.
        pub fn dropped(&self) -> u64 {
            self.dropped.load(Ordering::Relaxed)
        }
    }

    impl Delivery for AsyncSink {
        fn deliver(&mut self, batch: Vec<Packet>, vdev: &Vdev, peer: &Peer) {
            let n = batch.len() as u64;
            let delivered = Delivered {
                vdev: vdev.id,
                peer: peer.id,
                packets: batch,
            };
            if self.tx.try_send(delivered).is_err() {
                self.dropped.fetch_add(n, Ordering::Relaxed);
            }
        }
    }

    pub fn channel(capacity: usize) -> (AsyncSink, mpsc::Receiver<Delivered>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            AsyncSink {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }
}
