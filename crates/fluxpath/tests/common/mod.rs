#![allow(dead_code)]

use fluxpath::builder::DatapathBuilder;
use fluxpath::simulator::Simulator;
use fluxpath::{BankConfig, Datapath, DpConfig, Peer, PeerTable, RxReaper, TxCompletion, Vdev};
use std::sync::Arc;

pub const VDEV_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0xAA];

pub fn sta_mac(id: u16) -> [u8; 6] {
    [0x02, 0, 0, 0, (id >> 8) as u8, id as u8]
}

pub struct Rig {
    pub dp: Arc<Datapath>,
    pub sim: Simulator,
    pub rx: Vec<RxReaper>,
    pub comp: Vec<TxCompletion>,
    pub peers: Arc<PeerTable>,
}

/// Small device: one chip, one pool of 64 RX buffers, vdev 0 with its BSS
/// peer 0 and authorized stations 1 and 2.
pub fn small_config() -> DpConfig {
    DpConfig {
        rx_descs_per_pool: 64,
        rx_ring_size: 64,
        refill_ring_size: 64,
        frame_count: 1024,
        tx_descs_per_pool: 64,
        tx_ext_descs: 16,
        tx_ring_size: 64,
        comp_ring_size: 64,
        max_tx_outstanding: 32,
        max_vdev_tx_outstanding: 32,
        tx_special_allowance: 8,
        reserve_size: 8,
        ..Default::default()
    }
}

pub fn rig(cfg: DpConfig) -> Rig {
    rig_with(DatapathBuilder::new().config(cfg))
}

pub fn rig_with(builder: DatapathBuilder) -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();

    let peers = Arc::new(PeerTable::new());
    peers.add_vdev(Vdev::new(0, 0, VDEV_MAC));
    peers.add_peer(Peer::new(0, 0, VDEV_MAC).bss());
    for id in 1..=2 {
        peers.add_peer(Peer::new(id, 0, sta_mac(id))).set_authorized(true);
    }

    let parts = builder.peers(peers.clone()).build().expect("datapath");
    let dp = parts.datapath;
    dp.vdev_attach(0, BankConfig::default()).expect("attach");
    Rig {
        sim: Simulator::new(dp.clone(), parts.device),
        dp,
        rx: parts.rx,
        comp: parts.completions,
        peers,
    }
}

/// Ethernet frame of `len` bytes whose payload is not a control frame.
pub fn data_frame(dst: [u8; 6], src: [u8; 6], len: usize) -> Vec<u8> {
    let mut f = vec![0u8; len.max(14)];
    f[0..6].copy_from_slice(&dst);
    f[6..12].copy_from_slice(&src);
    f[12..14].copy_from_slice(&0x86DDu16.to_be_bytes());
    for (i, b) in f.iter_mut().enumerate().skip(14) {
        *b = i as u8;
    }
    f
}

pub fn typed_frame(dst: [u8; 6], src: [u8; 6], eth_type: u16) -> Vec<u8> {
    let mut f = vec![0u8; 64];
    f[0..6].copy_from_slice(&dst);
    f[6..12].copy_from_slice(&src);
    f[12..14].copy_from_slice(&eth_type.to_be_bytes());
    f
}
