//! NAT classification for direct-connection offers.

use std::fmt;
use std::net::SocketAddr;

/// How this client's local endpoint relates to the endpoint the server sees
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionType {
    /// Address and port both survive the path to the server
    DirectConnect,
    /// Same address, rewritten port
    PortRestrictNat,
    /// Rewritten address, same port
    IpRestrictNat,
    /// Address and port both rewritten
    SymmetricNat,
}

impl ConnectionType {
    /// Classifies from the two endpoint comparisons.
    pub fn derive(addr_matches: bool, port_matches: bool) -> Self {
        match (addr_matches, port_matches) {
            (true, true) => ConnectionType::DirectConnect,
            (true, false) => ConnectionType::PortRestrictNat,
            (false, true) => ConnectionType::IpRestrictNat,
            (false, false) => ConnectionType::SymmetricNat,
        }
    }

    /// Classifies from the local and externally-perceived endpoints.
    /// A missing endpoint counts as a match.
    pub fn from_endpoints(local: Option<SocketAddr>, external: Option<SocketAddr>) -> Self {
        match (local, external) {
            (Some(local), Some(external)) => {
                Self::derive(local.ip() == external.ip(), local.port() == external.port())
            }
            _ => ConnectionType::DirectConnect,
        }
    }

    /// Protocol label carried in the `Conn-Type` field
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::DirectConnect => "Direct-Connect",
            ConnectionType::PortRestrictNat => "Port-Restrict-NAT",
            ConnectionType::IpRestrictNat => "IP-Restrict-NAT",
            ConnectionType::SymmetricNat => "Symmetric-NAT",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `NetID` field of the offer body: the external IPv4 address packed as a
/// little-endian signed integer, 0 when unknown or not IPv4.
pub fn net_id(external: Option<SocketAddr>) -> i32 {
    match external {
        Some(SocketAddr::V4(v4)) => i32::from_le_bytes(v4.ip().octets()),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ep(addr: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::from(addr)), port)
    }

    #[test]
    fn test_derive_all_combinations() {
        assert_eq!(ConnectionType::derive(true, true), ConnectionType::DirectConnect);
        assert_eq!(ConnectionType::derive(true, false), ConnectionType::PortRestrictNat);
        assert_eq!(ConnectionType::derive(false, true), ConnectionType::IpRestrictNat);
        assert_eq!(ConnectionType::derive(false, false), ConnectionType::SymmetricNat);
    }

    #[test]
    fn test_labels() {
        assert_eq!(ConnectionType::DirectConnect.as_str(), "Direct-Connect");
        assert_eq!(ConnectionType::PortRestrictNat.as_str(), "Port-Restrict-NAT");
        assert_eq!(ConnectionType::IpRestrictNat.as_str(), "IP-Restrict-NAT");
        assert_eq!(ConnectionType::SymmetricNat.as_str(), "Symmetric-NAT");
    }

    #[test]
    fn test_from_endpoints() {
        let local = ep([192, 168, 1, 10], 1863);
        assert_eq!(
            ConnectionType::from_endpoints(Some(local), Some(ep([24, 0, 0, 1], 1863))),
            ConnectionType::IpRestrictNat
        );
        assert_eq!(
            ConnectionType::from_endpoints(Some(local), Some(ep([192, 168, 1, 10], 40012))),
            ConnectionType::PortRestrictNat
        );
        assert_eq!(
            ConnectionType::from_endpoints(Some(local), None),
            ConnectionType::DirectConnect
        );
        assert_eq!(ConnectionType::from_endpoints(None, None), ConnectionType::DirectConnect);
    }

    #[test]
    fn test_net_id() {
        assert_eq!(net_id(Some(ep([24, 0, 0, 1], 1863))), 16777240);
        assert_eq!(net_id(None), 0);
    }
}
