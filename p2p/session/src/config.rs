//! Tunables for negotiation, chunking and direct connections.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the P2P session layer
#[derive(Clone, Debug)]
pub struct P2pConfig {
    /// Delay between accepting an invitation and offering a direct connection
    pub settle_delay: Duration,
    /// How long a direct-connection listener waits for an inbound peer
    pub listener_expiry: Duration,
    /// Largest body carried per chunk on the relay transport
    pub max_relay_chunk: usize,
    /// Largest body carried per chunk on a direct connection
    pub max_direct_chunk: usize,
    /// First port tried when binding a direct-connection listener
    pub probe_port_base: u16,
    /// Distance between successive probe ports
    pub probe_port_step: u16,
    /// Number of probe ports tried before giving up
    pub probe_attempts: u16,
    /// Router-forwarded ports to advertise, if any
    pub public_ports: Vec<u16>,
    /// Try the public ports before the probe range instead of after
    pub public_ports_first: bool,
    /// Local endpoint of the server connection, used to detect NAT
    pub local_endpoint: Option<SocketAddr>,
    /// Endpoint the server reports seeing us at, used to detect NAT
    pub external_endpoint: Option<SocketAddr>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(6),
            listener_expiry: Duration::from_secs(12),
            max_relay_chunk: 1202,
            max_direct_chunk: 1352,
            probe_port_base: 1119,
            probe_port_step: 100,
            probe_attempts: 5,
            public_ports: Vec::new(),
            public_ports_first: false,
            local_endpoint: None,
            external_endpoint: None,
        }
    }
}

impl P2pConfig {
    /// Ports to try when binding a direct-connection listener, in order.
    ///
    /// The probe range is `base, base+step, ...` for `probe_attempts` ports;
    /// configured public ports go before or after it per
    /// `public_ports_first`.
    pub fn probe_ports(&self) -> Vec<u16> {
        let probed = (0..self.probe_attempts)
            .map(|i| self.probe_port_base.wrapping_add(i.wrapping_mul(self.probe_port_step)));
        if self.public_ports_first {
            self.public_ports.iter().copied().chain(probed).collect()
        } else {
            probed.chain(self.public_ports.iter().copied()).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = P2pConfig::default();
        assert_eq!(config.settle_delay, Duration::from_secs(6));
        assert_eq!(config.listener_expiry, Duration::from_secs(12));
        assert_eq!(config.max_relay_chunk, 1202);
        assert_eq!(config.max_direct_chunk, 1352);
        assert_eq!(config.probe_port_base, 1119);
        assert_eq!(config.probe_port_step, 100);
        assert_eq!(config.probe_attempts, 5);
        assert!(config.public_ports.is_empty());
        assert!(!config.public_ports_first);
    }

    #[test]
    fn test_probe_ports_default_range() {
        let config = P2pConfig::default();
        assert_eq!(config.probe_ports(), vec![1119, 1219, 1319, 1419, 1519]);
    }

    #[test]
    fn test_probe_ports_public_placement() {
        let mut config = P2pConfig {
            probe_attempts: 2,
            public_ports: vec![6891, 6892],
            ..Default::default()
        };
        assert_eq!(config.probe_ports(), vec![1119, 1219, 6891, 6892]);
        config.public_ports_first = true;
        assert_eq!(config.probe_ports(), vec![6891, 6892, 1119, 1219]);
    }
}
