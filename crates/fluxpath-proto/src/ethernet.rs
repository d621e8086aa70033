#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct EthHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub eth_type: u16,
}

pub const ETH_HLEN: usize = 14;

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_ARP: u16 = 0x0806;
pub const ETH_P_IPV6: u16 = 0x86DD;
pub const ETH_P_EAPOL: u16 = 0x888E;
pub const ETH_P_WAPI: u16 = 0x88B4;

pub const BROADCAST: [u8; 6] = [0xFF; 6];

impl EthHeader {
    pub fn eth_type(&self) -> u16 {
        u16::from_be(self.eth_type)
    }

    /// Group bit of the destination address (covers broadcast too).
    pub fn is_multicast(&self) -> bool {
        self.dst[0] & 0x01 != 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst == BROADCAST
    }
}

pub fn parse_eth(data: &[u8]) -> Option<(&EthHeader, &[u8])> {
    if data.len() < ETH_HLEN {
        return None;
    }

    let ptr = data.as_ptr() as *const EthHeader;
    let header = unsafe { &*ptr };
    let payload = &data[ETH_HLEN..];

    Some((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eth_parsing() {
        let mut data = [0u8; 18];
        data[0..6].copy_from_slice(&BROADCAST);
        data[6..12].copy_from_slice(&[0x02, 0x12, 0x13, 0x14, 0x15, 0x16]);
        data[12..14].copy_from_slice(&ETH_P_EAPOL.to_be_bytes());
        data[14..18].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);

        let (header, payload) = parse_eth(&data).expect("Should parse eth");
        assert!(header.is_broadcast());
        assert!(header.is_multicast());
        assert_eq!(header.src, [0x02, 0x12, 0x13, 0x14, 0x15, 0x16]);
        assert_eq!(header.eth_type(), ETH_P_EAPOL);
        assert_eq!(payload, &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_unicast_destination() {
        let mut data = [0u8; 14];
        data[0] = 0x02;
        let (header, _) = parse_eth(&data).unwrap();
        assert!(!header.is_multicast());
        assert!(!header.is_broadcast());
    }

    #[test]
    fn test_eth_too_short() {
        let data = [0u8; 13];
        assert!(parse_eth(&data).is_none());
    }
}
