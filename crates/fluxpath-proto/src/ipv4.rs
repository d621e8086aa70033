#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Ipv4Header {
    pub ver_ihl: u8,
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    pub frag_off: u16,
    pub ttl: u8,
    pub proto: u8,
    pub check: u16,
    pub src: u32,
    pub dst: u32,
}

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

impl Ipv4Header {
    pub fn version(&self) -> u8 {
        self.ver_ihl >> 4
    }

    pub fn header_len(&self) -> usize {
        ((self.ver_ihl & 0x0F) as usize) * 4
    }

    /// Only the first fragment carries the L4 header.
    pub fn is_later_fragment(&self) -> bool {
        u16::from_be(self.frag_off) & 0x1FFF != 0
    }

    /// DSCP bits of the TOS byte; used to pick a TID.
    pub fn dscp(&self) -> u8 {
        self.tos >> 2
    }
}

pub fn parse_ipv4(data: &[u8]) -> Option<(&Ipv4Header, &[u8])> {
    if data.len() < std::mem::size_of::<Ipv4Header>() {
        return None;
    }

    let ptr = data.as_ptr() as *const Ipv4Header;
    let header = unsafe { &*ptr };
    if header.version() != 4 {
        return None;
    }

    let header_len = header.header_len();
    if header_len < 20 || data.len() < header_len {
        return None;
    }

    Some((header, &data[header_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_parsing() {
        let mut data = [0u8; 24];
        data[0] = 0x45;
        data[1] = 46 << 2; // EF
        data[9] = IPPROTO_UDP;
        data[20..24].copy_from_slice(&[0x11, 0x22, 0x33, 0x44]);

        let (header, payload) = parse_ipv4(&data).expect("Should parse ipv4");
        assert_eq!(header.header_len(), 20);
        assert_eq!(header.proto, IPPROTO_UDP);
        assert_eq!(header.dscp(), 46);
        assert!(!header.is_later_fragment());
        assert_eq!(payload, &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_ipv4_rejects_bad_version_and_ihl() {
        let mut data = [0u8; 24];
        data[0] = 0x65;
        assert!(parse_ipv4(&data).is_none());
        data[0] = 0x43;
        assert!(parse_ipv4(&data).is_none());
    }

    #[test]
    fn test_later_fragment() {
        let mut data = [0u8; 20];
        data[0] = 0x45;
        data[6..8].copy_from_slice(&0x0010u16.to_be_bytes());
        let (header, _) = parse_ipv4(&data).unwrap();
        assert!(header.is_later_fragment());
    }
}
