#![cfg(feature = "simulator")]

mod common;

use common::*;
use fluxpath::hooks::{FlowControl, Inspector, McastFanout};
use fluxpath::simulator::CompStatus;
use fluxpath::tx::status::{fw_status, TqmReason, REINJECT_MLO_MCAST};
use fluxpath::{BankConfig, CookieMode, DatapathBuilder, FluxError, Packet, PeerId, TxParams, VdevId};
use fluxpath_core::ring::entry::{release_src, tx, DESC_VA_INVALIDATED};
use fluxpath_core::ring::TxCompEntry;
use fluxpath_core::UmemDma;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FlowLog(Mutex<Vec<(&'static str, VdevId)>>);

impl FlowControl for FlowLog {
    fn pause(&self, vdev: VdevId) {
        self.0.lock().unwrap().push(("pause", vdev));
    }
    fn resume(&self, vdev: VdevId) {
        self.0.lock().unwrap().push(("resume", vdev));
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(usize, VdevId, PeerId)>>);

impl Inspector for Recorder {
    fn inspect(&self, packet: &Packet, vdev: VdevId, peer: PeerId) {
        self.0.lock().unwrap().push((packet.len(), vdev, peer));
    }
}

impl McastFanout for Recorder {
    fn fan_out(&self, packet: Packet, vdev: VdevId) {
        self.0.lock().unwrap().push((packet.len(), vdev, 0));
    }
}

fn dma_rig() -> (Rig, Arc<UmemDma>) {
    let dma = Arc::new(UmemDma::new(0x1000_0000));
    let r = rig_with(DatapathBuilder::new().config(small_config()).dma(dma.clone()));
    (r, dma)
}

#[test]
fn test_fw_ttl_drop_releases_descriptor_once() {
    let (mut r, dma) = dma_rig();
    let baseline = dma.live_mappings();

    // 1. Send to peer 1 and let the device pick it up
    let frame = data_frame(sta_mac(1), VDEV_MAC, 300);
    let packet = r.dp.alloc_packet(&frame).unwrap();
    r.dp.send_exception(packet, TxParams::new(0).peer(1)).unwrap();
    assert_eq!(r.dp.tx_in_use(), 1);
    assert_eq!(r.dp.admission().outstanding(), 1);
    let frames = r.sim.transmit(0, 16);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data, frame);
    assert_eq!(frames[0].entry.peer_id, 1);

    // 2. Firmware reports a TTL expiry
    r.sim
        .complete(0, &frames[0], CompStatus::Fw(fw_status::TTL))
        .unwrap();
    assert_eq!(r.comp[0].reap(64).unwrap(), 1);
    let peer = r.peers.get(1).unwrap();
    assert_eq!(peer.stats.tx_dropped.load(Ordering::Relaxed), 1);
    assert_eq!(peer.stats.tx_drop.fw_rem_tx.load(Ordering::Relaxed), 1);
    assert_eq!(peer.stats.tx_drop.age_out.load(Ordering::Relaxed), 0);
    assert_eq!(peer.ref_count(), 0);
    assert_eq!(r.dp.stats().comp_dropped, 1);
    assert_eq!(r.dp.tx_in_use(), 0);
    assert_eq!(r.dp.admission().outstanding(), 0);
    assert_eq!(r.dp.vdev_outstanding(0), 0);
    assert_eq!(dma.live_mappings(), baseline);

    // 3. The same completion again names a free descriptor
    r.sim
        .complete(0, &frames[0], CompStatus::Fw(fw_status::TTL))
        .unwrap();
    assert!(matches!(r.comp[0].reap(64), Err(FluxError::Corruption(_))));
    assert!(r.dp.is_halted());
    assert_eq!(peer.stats.tx_dropped.load(Ordering::Relaxed), 1);
}

#[test]
fn test_tqm_ack_and_drop_counted_per_peer() {
    let mut r = rig(small_config());
    for _ in 0..2 {
        let packet = r.dp.alloc_packet(&data_frame(sta_mac(2), VDEV_MAC, 100)).unwrap();
        r.dp.send_exception(packet, TxParams::new(0).peer(2)).unwrap();
    }
    let frames = r.sim.transmit(0, 16);
    r.sim.complete(0, &frames[0], CompStatus::Acked).unwrap();
    r.sim
        .complete(0, &frames[1], CompStatus::Tqm(TqmReason::RemCmdAged))
        .unwrap();

    assert_eq!(r.comp[0].reap(64).unwrap(), 2);
    let peer = r.peers.get(2).unwrap();
    assert_eq!(peer.stats.tx_acked.load(Ordering::Relaxed), 1);
    assert_eq!(peer.stats.tx_dropped.load(Ordering::Relaxed), 1);
    assert_eq!(peer.stats.tx_drop.age_out.load(Ordering::Relaxed), 1);
    assert_eq!(peer.stats.tx_drop.fw_rem_tx.load(Ordering::Relaxed), 0);
    let stats = r.dp.stats();
    assert_eq!(stats.comp_acked, 1);
    assert_eq!(stats.comp_dropped, 1);
    assert_eq!(stats.comp_reaped, 2);
}

#[test]
fn test_admission_ceiling_and_special_allowance() {
    let flow = Arc::new(FlowLog::default());
    let mut r = rig_with(
        DatapathBuilder::new()
            .config(small_config())
            .flow_control(flow.clone()),
    );

    // 1. Ordinary frames fill the ceiling, the vdev is paused at the top
    for _ in 0..32 {
        let packet = r.dp.alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 60)).unwrap();
        r.dp.send(0, packet).unwrap();
    }
    assert_eq!(*flow.0.lock().unwrap(), vec![("pause", 0)]);

    let packet = r.dp.alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 60)).unwrap();
    let reject = r.dp.send(0, packet).unwrap_err();
    assert!(matches!(reject.error, FluxError::AdmissionDenied));
    assert_eq!(reject.packets.len(), 1);
    assert_eq!(r.dp.stats().tx_admission_denied, 1);

    // 2. ARP still gets through, up to the allowance
    for _ in 0..8 {
        let packet = r.dp.alloc_packet(&typed_frame(sta_mac(1), VDEV_MAC, 0x0806)).unwrap();
        r.dp.send(0, packet).unwrap();
    }
    let packet = r.dp.alloc_packet(&typed_frame(sta_mac(1), VDEV_MAC, 0x0806)).unwrap();
    assert!(r.dp.send(0, packet).is_err());
    assert_eq!(r.dp.admission().outstanding(), 40);

    // 3. Completing everything resumes the vdev once
    let frames = r.sim.transmit(0, 64);
    assert_eq!(frames.len(), 40);
    for f in &frames {
        r.sim.complete(0, f, CompStatus::Acked).unwrap();
    }
    assert_eq!(r.comp[0].reap(64).unwrap(), 40);
    assert_eq!(r.dp.admission().outstanding(), 0);
    assert_eq!(r.dp.vdev_outstanding(0), 0);
    assert_eq!(
        *flow.0.lock().unwrap(),
        vec![("pause", 0), ("resume", 0)]
    );
}

#[test]
fn test_segment_failure_returns_every_segment() {
    let (mut r, dma) = dma_rig();
    let baseline = dma.live_mappings();
    let segments = |r: &Rig| -> Vec<Packet> {
        (0..3)
            .map(|i| {
                r.dp
                    .alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 200 + i))
                    .unwrap()
            })
            .collect()
    };

    // 1. Third mapping fails: nothing queued, nothing leaked
    dma.fail_nth(3);
    let reject = r
        .dp
        .send_segments(segments(&r), TxParams::new(0).peer(1))
        .unwrap_err();
    assert!(matches!(reject.error, FluxError::DmaMap));
    assert_eq!(reject.packets.len(), 3);
    assert_eq!(dma.live_mappings(), baseline);
    assert_eq!(r.dp.tx_in_use(), 0);
    assert_eq!(r.dp.admission().outstanding(), 0);
    assert_eq!(r.dp.vdev_outstanding(0), 0);
    assert_eq!(r.dp.stats().tx_dma_fail, 1);
    assert!(r.sim.transmit(0, 16).is_empty());

    // 2. Retried, all three go out and only the last closes the frame
    r.dp
        .send_segments(segments(&r), TxParams::new(0).peer(1))
        .unwrap();
    let frames = r.sim.transmit(0, 16);
    assert_eq!(frames.len(), 3);
    let last: Vec<bool> = frames
        .iter()
        .map(|f| f.entry.flags & tx::LAST_SEGMENT != 0)
        .collect();
    assert_eq!(last, vec![false, false, true]);
    assert_eq!(frames[2].data.len(), 202);
}

#[test]
fn test_multi_buffer_frame_uses_extension_descriptor() {
    let (mut r, dma) = dma_rig();
    let baseline = dma.live_mappings();
    let frame = data_frame(sta_mac(1), VDEV_MAC, 5000);
    let packet = r.dp.alloc_packet(&frame).unwrap();
    assert_eq!(packet.num_frags(), 3);

    r.dp.send_exception(packet, TxParams::new(0).peer(1)).unwrap();
    assert_eq!(r.dp.ext_in_use(), 1);
    assert_eq!(dma.live_mappings(), baseline + 3);

    let frames = r.sim.transmit(0, 16);
    assert_eq!(frames.len(), 1);
    assert_ne!(frames[0].entry.flags & tx::EXT_DESC, 0);
    assert_eq!(frames[0].entry.num_frags, 3);
    assert_eq!(frames[0].data, frame);

    r.sim.complete(0, &frames[0], CompStatus::Acked).unwrap();
    r.comp[0].reap(64).unwrap();
    assert_eq!(r.dp.ext_in_use(), 0);
    assert_eq!(r.dp.tx_in_use(), 0);
    assert_eq!(dma.live_mappings(), baseline);
}

#[test]
fn test_too_many_fragments_rejected() {
    let r = rig(small_config());
    let packet = r.dp.alloc_packet(&vec![0u8; 2048 * 7]).unwrap();
    let reject = r.dp.send(0, packet).unwrap_err();
    assert!(matches!(reject.error, FluxError::Exhausted(_)));
    assert_eq!(reject.packets.len(), 1);
    assert_eq!(r.dp.admission().outstanding(), 0);
    assert_eq!(r.dp.tx_in_use(), 0);
}

#[test]
fn test_detach_flushes_outstanding_descriptors() {
    let mut r = rig(small_config());
    for _ in 0..3 {
        let packet = r.dp.alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 80)).unwrap();
        r.dp.send_exception(packet, TxParams::new(0).peer(1)).unwrap();
    }
    let frames = r.sim.transmit(0, 16);

    // 1. Detach while the device still owns the frames
    assert_eq!(r.dp.vdev_detach(0, false).unwrap(), 3);
    assert!(!r.dp.vdev_attached(0));
    assert_eq!(r.dp.vdev_outstanding(0), 0);
    assert_eq!(r.dp.admission().outstanding(), 3);
    assert_eq!(r.dp.tx_in_use(), 3);

    let packet = r.dp.alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 80)).unwrap();
    let reject = r.dp.send(0, packet).unwrap_err();
    assert!(matches!(reject.error, FluxError::VdevDown(0)));
    assert_eq!(r.dp.stats().tx_vdev_down, 1);

    // 2. Late completions only free the descriptors
    for f in &frames {
        r.sim.complete(0, f, CompStatus::Acked).unwrap();
    }
    assert_eq!(r.comp[0].reap(64).unwrap(), 3);
    let stats = r.dp.stats();
    assert_eq!(stats.comp_freed_in_detach, 3);
    assert_eq!(stats.comp_acked, 0);
    assert_eq!(r.dp.tx_in_use(), 0);
    assert_eq!(r.dp.admission().outstanding(), 0);
    assert_eq!(r.peers.get(1).unwrap().stats.tx_acked.load(Ordering::Relaxed), 0);
}

#[test]
fn test_force_detach_releases_immediately() {
    let (r, dma) = dma_rig();
    let baseline = dma.live_mappings();
    let bank = r.dp.vdev_bank(0).unwrap();
    for _ in 0..2 {
        let packet = r.dp.alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 80)).unwrap();
        r.dp.send(0, packet).unwrap();
    }

    assert_eq!(r.dp.vdev_detach(0, true).unwrap(), 2);
    assert_eq!(r.dp.tx_in_use(), 0);
    assert_eq!(r.dp.admission().outstanding(), 0);
    assert_eq!(dma.live_mappings(), baseline);
    assert_eq!(r.dp.banks().refs(bank), 0);
    assert_eq!(r.dp.vdev_detach(0, true).unwrap(), 0);
}

#[test]
fn test_hardware_cookie_conversion() {
    let mut r = rig_with(
        DatapathBuilder::new()
            .config(small_config())
            .cookie_mode(CookieMode::Hardware),
    );
    let packet = r.dp.alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 120)).unwrap();
    r.dp.send_exception(packet, TxParams::new(0).peer(1)).unwrap();
    let frames = r.sim.transmit(0, 16);

    // 1. The device hands back a descriptor handle instead of the cookie
    r.sim.complete(0, &frames[0], CompStatus::Acked).unwrap();
    assert_eq!(r.comp[0].reap(64).unwrap(), 1);
    assert_eq!(r.dp.stats().comp_acked, 1);
    assert_eq!(r.dp.tx_in_use(), 0);

    // 2. An entry already marked as reaped is a replay
    let handle = r.dp.tx_desc_handle(frames[0].entry.cookie).unwrap();
    let replay = TxCompEntry {
        cookie: frames[0].entry.cookie,
        release_src: release_src::TQM,
        cc_done: 1,
        desc_va: ((DESC_VA_INVALIDATED as u64) << 32) | handle as u64,
        peer_id: 1,
        ..Default::default()
    };
    r.sim.complete_entry(0, replay).unwrap();
    assert!(matches!(r.comp[0].reap(64), Err(FluxError::Corruption(_))));
    assert!(r.dp.is_halted());
}

#[test]
fn test_hardware_handle_of_free_descriptor_is_fatal() {
    let mut r = rig_with(
        DatapathBuilder::new()
            .config(small_config())
            .cookie_mode(CookieMode::Hardware),
    );
    let packet = r.dp.alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 120)).unwrap();
    r.dp.send_exception(packet, TxParams::new(0).peer(1)).unwrap();
    let frames = r.sim.transmit(0, 16);
    r.sim.complete(0, &frames[0], CompStatus::Acked).unwrap();
    assert_eq!(r.comp[0].reap(64).unwrap(), 1);

    // A fresh, unmarked entry for a descriptor that was already released
    r.sim.complete(0, &frames[0], CompStatus::Acked).unwrap();
    assert!(matches!(r.comp[0].reap(64), Err(FluxError::Corruption(_))));
    assert!(matches!(r.comp[0].reap(64), Err(FluxError::Halted)));
}

#[test]
fn test_reinject_sends_frame_again() {
    let mut r = rig(small_config());
    let frame = data_frame(sta_mac(1), VDEV_MAC, 400);
    let packet = r.dp.alloc_packet(&frame).unwrap();
    r.dp.send_exception(packet, TxParams::new(0).peer(1).tid(5)).unwrap();
    let frames = r.sim.transmit(0, 16);

    r.sim.complete(0, &frames[0], CompStatus::Reinject(1)).unwrap();
    assert_eq!(r.comp[0].reap(64).unwrap(), 1);
    assert_eq!(r.dp.stats().tx_reinjected, 1);
    assert_eq!(r.dp.tx_in_use(), 1);

    let again = r.sim.transmit(0, 16);
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].data, frame);
    assert_eq!(again[0].entry.peer_id, 1);
    assert_eq!(again[0].entry.tid, 5);
}

#[test]
fn test_mlo_mcast_reinject_goes_to_fanout() {
    let fanout = Arc::new(Recorder::default());
    let mut r = rig_with(
        DatapathBuilder::new()
            .config(small_config())
            .mcast_fanout(fanout.clone()),
    );
    let packet = r
        .dp
        .alloc_packet(&data_frame([0xFF; 6], VDEV_MAC, 90))
        .unwrap();
    r.dp
        .send_exception(packet, TxParams::new(0).peer(0).mcast_mlo().to_fw())
        .unwrap();
    let frames = r.sim.transmit(0, 16);
    assert_ne!(frames[0].entry.flags & tx::MCAST_MLO, 0);
    assert_ne!(frames[0].entry.flags & tx::TO_FW, 0);

    r.sim
        .complete(0, &frames[0], CompStatus::Reinject(REINJECT_MLO_MCAST))
        .unwrap();
    r.comp[0].reap(64).unwrap();
    assert_eq!(*fanout.0.lock().unwrap(), vec![(90, 0, 0)]);
    assert_eq!(r.dp.stats().tx_mcast_fanout, 1);
    assert_eq!(r.dp.tx_in_use(), 0);
}

#[test]
fn test_inspect_status_reaches_inspector() {
    let inspector = Arc::new(Recorder::default());
    let mut r = rig_with(
        DatapathBuilder::new()
            .config(small_config())
            .inspector(inspector.clone()),
    );
    let packet = r.dp.alloc_packet(&data_frame(sta_mac(2), VDEV_MAC, 70)).unwrap();
    r.dp.send_exception(packet, TxParams::new(0).peer(2)).unwrap();
    let frames = r.sim.transmit(0, 16);

    r.sim
        .complete(0, &frames[0], CompStatus::Fw(fw_status::INSPECT))
        .unwrap();
    r.comp[0].reap(64).unwrap();
    assert_eq!(*inspector.0.lock().unwrap(), vec![(70, 0, 2)]);
    assert_eq!(r.dp.stats().comp_inspected, 1);
}

#[test]
fn test_completion_filters() {
    let mut r = rig(small_config());
    let packet = r.dp.alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 70)).unwrap();
    r.dp.send_exception(packet, TxParams::new(0).peer(1)).unwrap();
    let frames = r.sim.transmit(0, 16);

    // 1. Address-learning notices carry no descriptor
    r.sim
        .complete_entry(
            0,
            TxCompEntry {
                release_src: release_src::FW,
                status: fw_status::MEC_NOTIFY,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(r.comp[0].reap(64).unwrap(), 0);
    assert_eq!(r.dp.stats().comp_mec_notify, 1);
    assert_eq!(r.dp.tx_in_use(), 1);

    // 2. A ring the device flagged is left alone
    r.sim.set_comp_ring_error(0, true);
    assert_eq!(r.comp[0].reap(64).unwrap(), 0);
    assert_eq!(r.dp.stats().comp_ring_access_fail, 1);
    r.sim.set_comp_ring_error(0, false);

    r.sim.complete(0, &frames[0], CompStatus::Acked).unwrap();
    assert_eq!(r.comp[0].reap(64).unwrap(), 1);
    assert_eq!(r.dp.tx_in_use(), 0);
}

#[test]
fn test_invalid_source_still_releases_descriptor() {
    let (mut r, dma) = dma_rig();
    let baseline = dma.live_mappings();
    let packet = r.dp.alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 120)).unwrap();
    r.dp.send_exception(packet, TxParams::new(0).peer(1)).unwrap();
    let frames = r.sim.transmit(0, 16);

    // Unknown source tag, but the cookie names a frame in flight
    r.sim
        .complete(0, &frames[0], CompStatus::Source(release_src::REO))
        .unwrap();
    assert_eq!(r.comp[0].reap(64).unwrap(), 1);

    let stats = r.dp.stats();
    assert_eq!(stats.comp_invalid_source, 1);
    assert_eq!(stats.comp_dropped, 1);
    assert_eq!(r.dp.tx_in_use(), 0);
    assert_eq!(r.dp.admission().outstanding(), 0);
    assert_eq!(dma.live_mappings(), baseline);
    let peer = r.peers.get(1).unwrap();
    assert_eq!(peer.stats.tx_drop.invalid_rr.load(Ordering::Relaxed), 1);
    assert!(!r.dp.is_halted());
}

#[test]
fn test_invalid_source_with_dead_cookie_is_skipped() {
    let mut r = rig(small_config());
    r.sim
        .complete_entry(
            0,
            TxCompEntry {
                release_src: release_src::REO,
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(r.comp[0].reap(64).unwrap(), 0);
    assert_eq!(r.dp.stats().comp_invalid_source, 1);
    assert!(!r.dp.is_halted());
}

#[test]
fn test_failed_reinject_is_counted() {
    let (mut r, dma) = dma_rig();
    let baseline = dma.live_mappings();
    let packet = r.dp.alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 200)).unwrap();
    r.dp.send_exception(packet, TxParams::new(0).peer(1)).unwrap();
    let frames = r.sim.transmit(0, 16);
    r.sim.complete(0, &frames[0], CompStatus::Reinject(1)).unwrap();

    // The retransmission cannot be mapped
    dma.fail_nth(1);
    assert_eq!(r.comp[0].reap(64).unwrap(), 1);

    let stats = r.dp.stats();
    assert_eq!(stats.tx_reinject_fail, 1);
    assert_eq!(stats.tx_reinjected, 0);
    assert_eq!(r.dp.tx_in_use(), 0);
    assert_eq!(r.dp.admission().outstanding(), 0);
    assert_eq!(dma.live_mappings(), baseline);
    assert!(r.sim.transmit(0, 16).is_empty());
}

#[test]
fn test_doorbell_coalescing() {
    let mut r = rig_with(
        DatapathBuilder::new()
            .config(small_config())
            .doorbell_coalesce(true),
    );

    // 1. Submissions stay invisible until the doorbell is rung
    for _ in 0..3 {
        let packet = r.dp.alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 60)).unwrap();
        r.dp.send(0, packet).unwrap();
    }
    assert!(r.sim.transmit(0, 16).is_empty());
    assert_eq!(r.dp.stats().tx_doorbells, 0);
    assert_eq!(r.dp.flush_tx_doorbells(), 1);
    assert_eq!(r.sim.transmit(0, 16).len(), 3);
    assert_eq!(r.dp.flush_tx_doorbells(), 0);

    // 2. A flush request rings it right away
    let packet = r.dp.alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 60)).unwrap();
    r.dp.send_exception(packet, TxParams::new(0).flush()).unwrap();
    assert_eq!(r.sim.transmit(0, 16).len(), 1);
    assert_eq!(r.dp.stats().tx_doorbells, 2);
}

#[test]
fn test_vdevs_share_banks_by_config() {
    let r = rig(small_config());
    let bank0 = r.dp.vdev_bank(0).unwrap();

    // 1. Same profile, same bank
    assert_eq!(r.dp.vdev_attach(1, BankConfig::default()).unwrap(), bank0);
    assert_eq!(r.dp.banks().refs(bank0), 2);

    // 2. A different profile gets its own bank, the old one keeps vdev 0
    let encrypted = BankConfig {
        encrypt_type: 3,
        ..Default::default()
    };
    let bank1 = r.dp.vdev_update(1, encrypted).unwrap();
    assert_ne!(bank1, bank0);
    assert_eq!(r.dp.banks().refs(bank0), 1);
    assert_eq!(r.dp.banks().refs(bank1), 1);
    assert_eq!(r.dp.banks().value(bank1), Some(encrypted.encode()));

    // 3. Frames carry the bank of their vdev
    let packet = r.dp.alloc_packet(&data_frame(sta_mac(1), VDEV_MAC, 60)).unwrap();
    r.dp.send(1, packet).unwrap();
    r.dp.vdev_detach(1, true).unwrap();
    assert_eq!(r.dp.banks().refs(bank1), 0);
}
