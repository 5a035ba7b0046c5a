//! # veil-types
//!
//! Shared domain types used across the Veil workspace.

pub mod circuit;
pub mod network;

pub use circuit::{CircuitId, Direction};
pub use network::NodeRegistration;

/// Default number of hops in a client circuit.
pub const DEFAULT_CIRCUIT_HOPS: usize = 3;

/// Error raised when a domain value cannot be parsed.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    /// A node registration names an address that does not parse.
    #[error("invalid node address {address}:{port}: {reason}")]
    InvalidAddress {
        address: String,
        port: u16,
        reason: String,
    },
}
