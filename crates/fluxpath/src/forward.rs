//! Intra-BSS forwarding: bridging a received frame straight back out to
//! another station of the same network instead of delivering it.

use crate::context::Datapath;
use crate::packet::{Packet, PacketMeta};
use crate::peer::{Peer, PeerDirectory, Vdev, VdevId, INTRABSS_PEER};
use crate::stats::bump;
use crate::tx::TxParams;
use fluxpath_proto::{classify, parse_eth};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwdDecision {
    /// Hand the frame to the host only.
    Deliver,
    /// Authentication frame for someone else; consumed without delivery.
    Drop,
    /// Send a copy back out and deliver the original.
    CloneAndDeliver,
    /// Send the frame out on `vdev`. `dest_chip` is set when the
    /// destination lives on another chip.
    Forward { vdev: VdevId, dest_chip: Option<u8> },
}

/// Decides what to do with a frame received from `ta` on `vdev`.
pub fn decide(
    peers: &dyn PeerDirectory,
    ta: &Peer,
    vdev: &Vdev,
    meta: &PacketMeta,
    frame: &[u8],
) -> FwdDecision {
    if !vdev.ap_bridge {
        return FwdDecision::Deliver;
    }

    if meta.da_is_mcbc && !ta.is_bss {
        if ta.is_isolated() {
            return FwdDecision::Deliver;
        }
        return FwdDecision::CloneAndDeliver;
    }

    if classify(frame).is_auth() {
        let to_self = parse_eth(frame)
            .map(|(eth, _)| vdev.is_own_addr(&{ eth.dst }))
            .unwrap_or(false);
        if !to_self {
            return FwdDecision::Drop;
        }
    }

    if !meta.da_valid || meta.da_is_mcbc {
        return FwdDecision::Deliver;
    }
    let Some(da) = peers.peer(meta.da_peer) else {
        return FwdDecision::Deliver;
    };
    if ta.is_isolated() || da.is_isolated() {
        return FwdDecision::Deliver;
    }
    if da.is_bss || da.id == ta.id {
        return FwdDecision::Deliver;
    }
    if da.vdev_id == ta.vdev_id {
        return FwdDecision::Forward {
            vdev: da.vdev_id,
            dest_chip: None,
        };
    }

    match peers.vdev(da.vdev_id) {
        Some(da_vdev) if da_vdev.is_partner_of(vdev) => FwdDecision::Forward {
            vdev: da_vdev.id,
            dest_chip: (da_vdev.chip != vdev.chip).then_some(da_vdev.chip),
        },
        _ => FwdDecision::Deliver,
    }
}

/// Carries out `decision`. Returns the frame when it still has to be delivered.
pub(crate) fn apply(
    dp: &Datapath,
    decision: FwdDecision,
    packet: Packet,
    ta: &Peer,
    vdev: &Vdev,
) -> Option<Packet> {
    match decision {
        FwdDecision::Deliver => Some(packet),
        FwdDecision::Drop => {
            bump(&dp.stats.rx_intrabss_eapol_drop);
            None
        }
        FwdDecision::CloneAndDeliver => {
            send_copy(dp, &packet, ta, vdev);
            Some(packet)
        }
        FwdDecision::Forward { vdev: tx_vdev, dest_chip } => {
            forward_unicast(dp, packet, ta, tx_vdev, dest_chip)
        }
    }
}

fn record(dp: &Datapath, ta: &Peer, meta: &PacketMeta, ok: bool) {
    let tid = dp.tid_stats.get(meta.ring_id, meta.tid);
    if ok {
        bump(&dp.stats.rx_intrabss_fwd);
        bump(&ta.stats.intrabss_packets);
        if let Some(t) = tid {
            bump(&t.intrabss);
        }
    } else {
        bump(&dp.stats.rx_intrabss_fail);
        bump(&ta.stats.intrabss_fail);
        if let Some(t) = tid {
            bump(&t.fail);
        }
    }
}

fn send_copy(dp: &Datapath, packet: &Packet, ta: &Peer, vdev: &Vdev) {
    let meta = packet.meta.clone();
    let Some(copy) = packet.try_clone() else {
        record(dp, ta, &meta, false);
        return;
    };

    if vdev.nawds {
        let params = TxParams::new(vdev.id)
            .tid(meta.tid)
            .peer(ta.id)
            .intra_bss();
        let ok = dp.send_exception(copy, params).is_ok();
        record(dp, ta, &meta, ok);
        return;
    }

    if vdev.is_mlo() {
        if let Some(fanout) = dp.hooks.mcast_fanout.as_ref() {
            fanout.fan_out(copy, vdev.id);
            bump(&dp.stats.tx_mcast_fanout);
            record(dp, ta, &meta, true);
            return;
        }
    }

    let ok = dp.send(vdev.id, copy).is_ok();
    record(dp, ta, &meta, ok);
}

fn forward_unicast(
    dp: &Datapath,
    packet: Packet,
    ta: &Peer,
    tx_vdev: VdevId,
    dest_chip: Option<u8>,
) -> Option<Packet> {
    let meta = packet.meta.clone();

    if let Some(chip) = dest_chip {
        let Some(link) = dp.hooks.cross_link.as_ref() else {
            record(dp, ta, &meta, false);
            return Some(packet);
        };
        return match link.forward(packet, chip, tx_vdev) {
            Ok(()) => {
                bump(&dp.stats.rx_cross_link);
                record(dp, ta, &meta, true);
                None
            }
            Err(packet) => {
                record(dp, ta, &meta, false);
                Some(packet)
            }
        };
    }

    let params = TxParams::new(tx_vdev)
        .tid(meta.tid)
        .peer(INTRABSS_PEER)
        .intra_bss();
    match dp.send_exception(packet, params) {
        Ok(()) => {
            record(dp, ta, &meta, true);
            None
        }
        Err(mut rejected) => {
            log::trace!("intra-BSS forward failed: {}", rejected.error);
            record(dp, ta, &meta, false);
            rejected.packets.pop()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerTable;

    const VDEV_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0xAA];

    fn frame(dst: [u8; 6], eth_type: u16) -> Vec<u8> {
        let mut f = vec![0u8; 60];
        f[0..6].copy_from_slice(&dst);
        f[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        f[12..14].copy_from_slice(&eth_type.to_be_bytes());
        f
    }

    fn table() -> (PeerTable, Vdev) {
        let table = PeerTable::new();
        let vdev = Vdev::new(0, 0, VDEV_MAC);
        table.add_vdev(vdev.clone());
        table.add_peer(Peer::new(0, 0, VDEV_MAC).bss());
        table.add_peer(Peer::new(1, 0, [0x02, 0, 0, 0, 0, 1]));
        table.add_peer(Peer::new(2, 0, [0x02, 0, 0, 0, 0, 2]));
        (table, vdev)
    }

    fn unicast_meta(da: u16) -> PacketMeta {
        PacketMeta {
            peer_id: 1,
            da_valid: true,
            da_peer: da,
            ..Default::default()
        }
    }

    #[test]
    fn test_broadcast_is_cloned() {
        let (table, vdev) = table();
        let ta = table.get(1).unwrap();
        let meta = PacketMeta {
            da_is_mcbc: true,
            ..Default::default()
        };
        let arp = frame([0xFF; 6], 0x0806);
        assert_eq!(
            decide(&table, &ta, &vdev, &meta, &arp),
            FwdDecision::CloneAndDeliver
        );

        // 1. Isolated stations are not bridged
        ta.set_isolated(true);
        assert_eq!(decide(&table, &ta, &vdev, &meta, &arp), FwdDecision::Deliver);

        // 2. Nothing is bridged without AP bridging
        ta.set_isolated(false);
        let mut closed = vdev.clone();
        closed.ap_bridge = false;
        assert_eq!(decide(&table, &ta, &closed, &meta, &arp), FwdDecision::Deliver);
    }

    #[test]
    fn test_unicast_same_vdev_forwarded() {
        let (table, vdev) = table();
        let ta = table.get(1).unwrap();
        let data = frame([0x02, 0, 0, 0, 0, 2], 0x0800);
        assert_eq!(
            decide(&table, &ta, &vdev, &unicast_meta(2), &data),
            FwdDecision::Forward {
                vdev: 0,
                dest_chip: None
            }
        );

        // Destination isolated
        table.get(2).unwrap().set_isolated(true);
        assert_eq!(
            decide(&table, &ta, &vdev, &unicast_meta(2), &data),
            FwdDecision::Deliver
        );
    }

    #[test]
    fn test_bss_and_self_never_forwarded() {
        let (table, vdev) = table();
        let ta = table.get(1).unwrap();
        let data = frame(VDEV_MAC, 0x0800);
        assert_eq!(
            decide(&table, &ta, &vdev, &unicast_meta(0), &data),
            FwdDecision::Deliver
        );
        assert_eq!(
            decide(&table, &ta, &vdev, &unicast_meta(1), &data),
            FwdDecision::Deliver
        );
        // Unknown destination
        assert_eq!(
            decide(&table, &ta, &vdev, &unicast_meta(42), &data),
            FwdDecision::Deliver
        );
    }

    #[test]
    fn test_eapol_to_other_station_dropped() {
        let (table, vdev) = table();
        let ta = table.get(1).unwrap();

        let eapol = frame([0x02, 0, 0, 0, 0, 2], 0x888E);
        assert_eq!(
            decide(&table, &ta, &vdev, &unicast_meta(2), &eapol),
            FwdDecision::Drop
        );

        // Addressed to the AP itself: delivered
        let eapol = frame(VDEV_MAC, 0x888E);
        assert_eq!(
            decide(&table, &ta, &vdev, &unicast_meta(0), &eapol),
            FwdDecision::Deliver
        );
    }

    #[test]
    fn test_partner_link_on_other_chip() {
        let (table, _) = table();
        let mld = [0x06, 0, 0, 0, 0, 0x10];
        let mut a = Vdev::new(1, 0, [0x02, 0, 0, 0, 1, 0]);
        a.mld_mac = Some(mld);
        let mut b = Vdev::new(2, 1, [0x02, 0, 0, 0, 2, 0]);
        b.mld_mac = Some(mld);
        table.add_vdev(a.clone());
        table.add_vdev(b);
        let ta = table.add_peer(Peer::new(10, 1, [0x02, 0, 0, 0, 0, 10]));
        table.add_peer(Peer::new(11, 2, [0x02, 0, 0, 0, 0, 11]));

        let data = frame([0x02, 0, 0, 0, 0, 11], 0x0800);
        assert_eq!(
            decide(&table, &ta, &a, &unicast_meta(11), &data),
            FwdDecision::Forward {
                vdev: 2,
                dest_chip: Some(1)
            }
        );

        // A vdev of another device is not a partner
        table.add_vdev(Vdev::new(3, 0, [0x02, 0, 0, 0, 3, 0]));
        table.add_peer(Peer::new(12, 3, [0x02, 0, 0, 0, 0, 12]));
        assert_eq!(
            decide(&table, &ta, &a, &unicast_meta(12), &data),
            FwdDecision::Deliver
        );
    }
}
