use crate::ethernet::{parse_eth, ETH_P_ARP, ETH_P_EAPOL, ETH_P_IP, ETH_P_WAPI};
use crate::ipv4::{parse_ipv4, IPPROTO_UDP};
use crate::udp::parse_udp;

/// Control-plane frame kinds the datapath treats specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Eapol,
    Wapi,
    Arp,
    Dhcp,
    Other,
}

impl FrameClass {
    /// Frames admitted through the reserved TX allowance.
    pub fn is_special(self) -> bool {
        !matches!(self, FrameClass::Other)
    }

    /// Authentication frames: accepted from unauthorized peers, never bridged.
    pub fn is_auth(self) -> bool {
        matches!(self, FrameClass::Eapol | FrameClass::Wapi)
    }
}

/// Classifies an Ethernet II frame.
pub fn classify(frame: &[u8]) -> FrameClass {
    let Some((eth, payload)) = parse_eth(frame) else {
        return FrameClass::Other;
    };

    match eth.eth_type() {
        ETH_P_EAPOL => FrameClass::Eapol,
        ETH_P_WAPI => FrameClass::Wapi,
        ETH_P_ARP => FrameClass::Arp,
        ETH_P_IP => {
            let Some((ip, l4)) = parse_ipv4(payload) else {
                return FrameClass::Other;
            };
            if ip.proto != IPPROTO_UDP || ip.is_later_fragment() {
                return FrameClass::Other;
            }
            match parse_udp(l4) {
                Some((udp, _)) if udp.is_dhcp() => FrameClass::Dhcp,
                _ => FrameClass::Other,
            }
        }
        _ => FrameClass::Other,
    }
}
