#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub len: u16,
    pub check: u16,
}

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

impl UdpHeader {
    pub fn src_port(&self) -> u16 {
        u16::from_be(self.src_port)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be(self.dst_port)
    }

    pub fn is_dhcp(&self) -> bool {
        let (s, d) = (self.src_port(), self.dst_port());
        (s == DHCP_CLIENT_PORT && d == DHCP_SERVER_PORT)
            || (s == DHCP_SERVER_PORT && d == DHCP_CLIENT_PORT)
    }
}

pub fn parse_udp(data: &[u8]) -> Option<(&UdpHeader, &[u8])> {
    if data.len() < std::mem::size_of::<UdpHeader>() {
        return None;
    }

    let ptr = data.as_ptr() as *const UdpHeader;
    let header = unsafe { &*ptr };
    let payload = &data[std::mem::size_of::<UdpHeader>()..];

    Some((header, payload))
}
