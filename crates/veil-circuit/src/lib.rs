//! # veil-circuit
//!
//! The circuit protocol engine of the Veil onion-routing overlay.
//!
//! - [`table`] - Per-circuit state tables (hop linkage, hop secrets, relay connections)
//! - [`handshake`] - Per-hop X25519 handshake and layer key derivation
//! - [`layer`] - One-layer-per-hop ChaCha20-Poly1305 wrapping of relay bodies
//! - [`selection`] - Random path selection from the directory registry
//! - [`builder`] - Hop-by-hop circuit construction with bounded retries and rollback
//! - [`switchboard`] - Per-stream dispatch of `create` and `relay` cells, extension, link teardown
//! - [`relay`] - Forwarding of relay cells using only local circuit state
//! - [`node`] - Relay node runtime (accept loop, idle sweeper)
//! - [`client`] - Onion client facade
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Default circuit hops | 3 |
//! | I/O timeout | 1 s |
//! | Handshake timeout | 5 s |
//! | Attempts per hop | 3 |
//! | Idle circuit expiry | 10 minutes |
//! | KDF contexts | `veil v1 handshake-{seed,confirm}`, `veil v1 layer-{forward,backward}` |

pub mod builder;
pub mod client;
pub mod handshake;
pub mod layer;
pub mod node;
pub mod relay;
pub mod selection;
pub mod switchboard;
pub mod table;

use std::time::Duration;

use veil_directory::DirectoryError;
use veil_transport::TransportError;

pub use client::OnionClient;
pub use node::OnionNode;
pub use veil_types::DEFAULT_CIRCUIT_HOPS;

/// Default bound on accepts and single reads, in milliseconds.
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 1000;

/// Default bound on one handshake attempt, in milliseconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Default number of attempts per hop.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default idle time after which a circuit is forgotten (10 minutes).
pub const DEFAULT_CIRCUIT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default interval between idle sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Timing and retry settings shared by relays and clients.
#[derive(Clone, Debug)]
pub struct CircuitConfig {
    /// Bound on accepts and single reads. Also the stop-flag polling period.
    pub io_timeout: Duration,
    /// Bound on one `create` or `extend` attempt, and on client relay exchanges.
    pub handshake_timeout: Duration,
    /// Attempts per hop before the build fails.
    pub max_attempts: u32,
    /// Entries untouched for this long are removed by the sweeper.
    pub circuit_idle_timeout: Duration,
    /// How often the sweeper runs.
    pub sweep_interval: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            circuit_idle_timeout: Duration::from_secs(DEFAULT_CIRCUIT_IDLE_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

/// Error types for circuit operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    /// Received bytes do not decode to a known envelope.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A well-formed envelope that is not acceptable here.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Not enough registered nodes to build a path.
    #[error("insufficient nodes: need {need}, have {have}")]
    InsufficientNodes { need: usize, have: usize },

    /// Circuit construction failed at `hop` after exhausting its attempts.
    #[error("circuit build failed at hop {hop}: {reason}")]
    CircuitBuild { hop: usize, reason: String },

    /// Connection, I/O or timeout failure.
    #[error("network error: {0}")]
    Network(String),

    /// The relay's handshake reply did not verify.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// No local state for the circuit.
    #[error("unknown circuit {0}")]
    UnknownCircuit(veil_types::CircuitId),

    /// Cryptographic error from veil-crypto.
    #[error("crypto error: {0}")]
    Crypto(#[from] veil_crypto::CryptoError),

    /// The relay identity file is unusable.
    #[error("identity error: {0}")]
    Identity(String),

    /// Settings that cannot work, such as advertising an unspecified address.
    #[error("configuration error: {0}")]
    Config(String),

    /// Directory request failed.
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
}

impl From<TransportError> for CircuitError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::MalformedPacket(msg) => CircuitError::MalformedPacket(msg),
            TransportError::ProtocolViolation(msg) => CircuitError::ProtocolViolation(msg),
            other => CircuitError::Network(other.to_string()),
        }
    }
}

/// Convenience result type for circuit operations.
pub type Result<T> = std::result::Result<T, CircuitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CircuitConfig::default();
        assert_eq!(config.io_timeout, Duration::from_secs(1));
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.circuit_idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_error_display() {
        let err = CircuitError::InsufficientNodes { need: 3, have: 1 };
        assert!(err.to_string().contains("need 3"));
        assert!(err.to_string().contains("have 1"));
    }

    #[test]
    fn test_transport_error_mapping() {
        assert!(matches!(
            CircuitError::from(TransportError::MalformedPacket("x".into())),
            CircuitError::MalformedPacket(_)
        ));
        assert!(matches!(
            CircuitError::from(TransportError::ProtocolViolation("x".into())),
            CircuitError::ProtocolViolation(_)
        ));
        assert!(matches!(
            CircuitError::from(TransportError::Timeout(5)),
            CircuitError::Network(_)
        ));
    }
}
