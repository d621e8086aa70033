//! Peer and vdev directory.
//!
//! Peers and vdevs belong to the control path. The datapath only borrows
//! them: every lookup returns a counted reference that is given back when
//! the guard is dropped.

use crate::tx::status::TqmReason;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub type PeerId = u16;
pub type VdevId = u8;
pub type MacAddr = [u8; 6];

/// No peer attached to the frame.
pub const INVALID_PEER: PeerId = 0xFFFF;
/// Peer id stamped on frames re-sent by intra-BSS forwarding.
pub const INTRABSS_PEER: PeerId = 0xFFFE;

#[derive(Debug, Default)]
pub struct PeerStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_drops: AtomicU64,
    pub intrabss_packets: AtomicU64,
    pub intrabss_fail: AtomicU64,
    pub tx_acked: AtomicU64,
    /// All TX drops; `tx_drop` breaks them down by reason.
    pub tx_dropped: AtomicU64,
    pub tx_drop: TxDropStats,
}

/// TX drops of one peer, per queue-manager release reason.
#[derive(Debug, Default)]
pub struct TxDropStats {
    pub age_out: AtomicU64,
    pub fw_rem: AtomicU64,
    pub fw_rem_notx: AtomicU64,
    pub fw_rem_tx: AtomicU64,
    pub fw_reason1: AtomicU64,
    pub fw_reason2: AtomicU64,
    pub fw_reason3: AtomicU64,
    pub fw_rem_queue_disable: AtomicU64,
    pub fw_rem_no_match: AtomicU64,
    pub drop_threshold: AtomicU64,
    pub drop_link_desc_na: AtomicU64,
    pub invalid_drop: AtomicU64,
    pub mcast_vdev_drop: AtomicU64,
    /// Release reason this host does not know.
    pub invalid_rr: AtomicU64,
}

impl TxDropStats {
    pub fn for_reason(&self, reason: TqmReason) -> &AtomicU64 {
        match reason {
            TqmReason::RemCmdAged => &self.age_out,
            TqmReason::RemCmdRem => &self.fw_rem,
            TqmReason::RemCmdNotx => &self.fw_rem_notx,
            TqmReason::RemCmdTx => &self.fw_rem_tx,
            TqmReason::FwReason1 => &self.fw_reason1,
            TqmReason::FwReason2 => &self.fw_reason2,
            TqmReason::FwReason3 => &self.fw_reason3,
            TqmReason::DisableQueue => &self.fw_rem_queue_disable,
            TqmReason::TillNonmatching => &self.fw_rem_no_match,
            TqmReason::DropThreshold => &self.drop_threshold,
            TqmReason::LinkDescUnavailable => &self.drop_link_desc_na,
            TqmReason::DropOrInvalidMsdu => &self.invalid_drop,
            TqmReason::MulticastDrop => &self.mcast_vdev_drop,
            TqmReason::Acked => &self.invalid_rr,
        }
    }
}

#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub vdev_id: VdevId,
    pub mac: MacAddr,
    /// The vdev's own peer entry (AP self peer).
    pub is_bss: bool,
    /// Multi-link peer spanning several chips.
    pub is_mld: bool,
    authorized: AtomicBool,
    isolated: AtomicBool,
    refs: AtomicUsize,
    pub stats: PeerStats,
}

impl Peer {
    pub fn new(id: PeerId, vdev_id: VdevId, mac: MacAddr) -> Self {
        Self {
            id,
            vdev_id,
            mac,
            is_bss: false,
            is_mld: false,
            authorized: AtomicBool::new(false),
            isolated: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
            stats: PeerStats::default(),
        }
    }

    pub fn bss(mut self) -> Self {
        self.is_bss = true;
        self
    }

    pub fn mld(mut self) -> Self {
        self.is_mld = true;
        self
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::Acquire)
    }

    pub fn set_authorized(&self, on: bool) {
        self.authorized.store(on, Ordering::Release);
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated.load(Ordering::Acquire)
    }

    pub fn set_isolated(&self, on: bool) {
        self.isolated.store(on, Ordering::Release);
    }

    /// References currently held by the datapath.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

/// Counted reference to a peer; released on drop.
pub struct PeerRef(Arc<Peer>);

impl PeerRef {
    pub fn acquire(peer: Arc<Peer>) -> Self {
        peer.refs.fetch_add(1, Ordering::AcqRel);
        PeerRef(peer)
    }
}

impl Deref for PeerRef {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.0
    }
}

impl Drop for PeerRef {
    fn drop(&mut self) {
        self.0.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone)]
pub struct Vdev {
    pub id: VdevId,
    /// Chip (radio) the vdev lives on.
    pub chip: u8,
    pub mac: MacAddr,
    /// Multi-link address shared by partner vdevs on other chips.
    pub mld_mac: Option<MacAddr>,
    pub ap_bridge: bool,
    pub nawds: bool,
    pub raw_mode: bool,
    pub bss_peer: Option<PeerId>,
}

impl Vdev {
    pub fn new(id: VdevId, chip: u8, mac: MacAddr) -> Self {
        Self {
            id,
            chip,
            mac,
            mld_mac: None,
            ap_bridge: true,
            nawds: false,
            raw_mode: false,
            bss_peer: None,
        }
    }

    pub fn is_mlo(&self) -> bool {
        self.mld_mac.is_some()
    }

    /// True when both vdevs are links of the same multi-link device.
    pub fn is_partner_of(&self, other: &Vdev) -> bool {
        self.id != other.id && self.mld_mac.is_some() && self.mld_mac == other.mld_mac
    }

    /// Frame addressed to this vdev itself (own or MLD address).
    pub fn is_own_addr(&self, addr: &MacAddr) -> bool {
        &self.mac == addr || self.mld_mac.as_ref() == Some(addr)
    }
}

/// Lookups the datapath needs from the control path.
pub trait PeerDirectory: Send + Sync {
    fn peer(&self, id: PeerId) -> Option<PeerRef>;
    fn vdev(&self, id: VdevId) -> Option<Arc<Vdev>>;
}

/// In-memory directory used by the simulator and the tests.
#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
    vdevs: Mutex<HashMap<VdevId, Arc<Vdev>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vdev(&self, vdev: Vdev) -> Arc<Vdev> {
        let vdev = Arc::new(vdev);
        if let Ok(mut vdevs) = self.vdevs.lock() {
            vdevs.insert(vdev.id, vdev.clone());
        }
        vdev
    }

    pub fn remove_vdev(&self, id: VdevId) {
        if let Ok(mut vdevs) = self.vdevs.lock() {
            vdevs.remove(&id);
        }
    }

    pub fn add_peer(&self, peer: Peer) -> Arc<Peer> {
        let peer = Arc::new(peer);
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(peer.id, peer.clone());
        }
        peer
    }

    pub fn remove_peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.lock().ok().and_then(|mut p| p.remove(&id))
    }

    pub fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.lock().ok().and_then(|p| p.get(&id).cloned())
    }
}

impl PeerDirectory for PeerTable {
    fn peer(&self, id: PeerId) -> Option<PeerRef> {
        self.get(id).map(PeerRef::acquire)
    }

    fn vdev(&self, id: VdevId) -> Option<Arc<Vdev>> {
        self.vdevs.lock().ok().and_then(|v| v.get(&id).cloned())
    }
}
