//! # veil-transport
//!
//! Packet codec and network transport for the Veil onion-routing overlay.
//!
//! - **Message vocabulary** (directory and control cells) via [`messages`]
//! - **Envelope encoding and length-prefixed framing** via [`wire`]
//! - **CBOR serialization** helpers via [`cbor`]
//! - **QUIC/TLS 1.3** endpoints and request/response exchanges via [`quic`]
//! - **Stop signal** for accept loops via [`shutdown`]
//!
//! ## Architecture
//!
//! ```text
//! Circuit engine / directory
//!     |
//!     v
//! Packet (messages.rs)     -- tagged by `type`, then `command`
//!     |
//!     v
//! wire::encode / decode    -- CBOR body, 4-byte length prefix
//!     |
//!     v
//! QuicNode (quic.rs)       -- one bidirectional stream per exchange
//!     |
//!     v
//! UDP socket
//! ```

pub mod cbor;
pub mod messages;
pub mod quic;
pub mod shutdown;
pub mod wire;

pub use messages::{ControlCell, DirectoryMessage, Packet, RelayBody};
pub use quic::QuicNode;
pub use shutdown::StopFlag;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The bytes do not decode to a known envelope.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A well-formed envelope that the receiver does not accept in this role.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// CBOR serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// TLS/certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// QUIC connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// I/O error (socket, stream read/write).
    #[error("I/O error: {0}")]
    Io(String),

    /// A bounded wait elapsed.
    #[error("timed out after {0} ms")]
    Timeout(u64),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::MalformedPacket("bad".to_string());
        assert_eq!(err.to_string(), "malformed packet: bad");
        assert_eq!(TransportError::Timeout(250).to_string(), "timed out after 250 ms");
    }
}
