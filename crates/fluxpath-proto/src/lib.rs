pub mod classify;
pub mod ethernet;
pub mod ipv4;
pub mod udp;

pub use classify::{classify, FrameClass};
pub use ethernet::{parse_eth, EthHeader};
pub use ipv4::{parse_ipv4, Ipv4Header};
pub use udp::{parse_udp, UdpHeader};
