//! Directory-facing network structures.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::TypeError;

/// A relay's entry in the directory registry.
///
/// Keyed by `(address, port)`: a node re-registering from the same endpoint
/// replaces its previous entry.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistration {
    /// IP address the node listens on.
    pub address: String,
    /// UDP port of the node's QUIC endpoint.
    pub port: u16,
    /// The node's long-term X25519 public key.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub public_key: [u8; 32],
}

impl NodeRegistration {
    pub fn new(address: impl Into<String>, port: u16, public_key: [u8; 32]) -> Self {
        Self {
            address: address.into(),
            port,
            public_key,
        }
    }

    /// Build a registration from a bound socket address.
    pub fn from_socket_addr(addr: SocketAddr, public_key: [u8; 32]) -> Self {
        Self::new(addr.ip().to_string(), addr.port(), public_key)
    }

    /// Whether `other` names the same endpoint.
    pub fn same_endpoint(&self, other: &NodeRegistration) -> bool {
        self.address == other.address && self.port == other.port
    }

    /// Resolve to a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, TypeError> {
        let ip: IpAddr = self
            .address
            .parse()
            .map_err(|e: std::net::AddrParseError| TypeError::InvalidAddress {
                address: self.address.clone(),
                port: self.port,
                reason: e.to_string(),
            })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr() {
        let reg = NodeRegistration::new("127.0.0.1", 9001, [1u8; 32]);
        let addr = reg.socket_addr().expect("valid address");
        assert_eq!(addr, "127.0.0.1:9001".parse().expect("literal"));
    }

    #[test]
    fn test_invalid_address() {
        let reg = NodeRegistration::new("not-an-ip", 9001, [1u8; 32]);
        assert!(matches!(
            reg.socket_addr(),
            Err(TypeError::InvalidAddress { port: 9001, .. })
        ));
    }

    #[test]
    fn test_same_endpoint_ignores_key() {
        let a = NodeRegistration::new("10.0.0.1", 1, [1u8; 32]);
        let b = NodeRegistration::new("10.0.0.1", 1, [2u8; 32]);
        let c = NodeRegistration::new("10.0.0.1", 2, [1u8; 32]);
        assert!(a.same_endpoint(&b));
        assert!(!a.same_endpoint(&c));
    }

    #[test]
    fn test_public_key_is_hex_in_json() {
        let reg = NodeRegistration::new("10.0.0.1", 1, [0xabu8; 32]);
        let json = serde_json::to_string(&reg).expect("serialize");
        assert!(json.contains(&"ab".repeat(32)));
        let parsed: NodeRegistration = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, reg);
    }
}
