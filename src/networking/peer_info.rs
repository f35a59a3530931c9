use crate::constants::STREAM_PORT_OFFSET;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;

///
/// PeerInfo is the wire identity of a node: the (ip, udp_port) pair. It is
/// everything another node needs to reach a peer — datagram messages go to
/// the address as-is, and stream connections go to the derived stream
/// address.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerInfo {
    pub address: SocketAddr,
}

impl PeerInfo {
    pub fn new(address: SocketAddr) -> Self {
        PeerInfo { address }
    }

    /// Address of this peer's stream-transport listener. The offset rule is
    /// fixed for the whole network; only (ip, udp_port) travels on the wire.
    pub fn stream_address(&self) -> SocketAddr {
        SocketAddr::new(
            self.address.ip(),
            self.address.port().wrapping_add(STREAM_PORT_OFFSET),
        )
    }
}

impl Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl FromStr for PeerInfo {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeerInfo::new(s.parse()?))
    }
}
