//! # veil-crypto
//!
//! Cryptographic primitives consumed by the Veil circuit engine.
//!
//! The suite is fixed; there is no algorithm negotiation.
//!
//! ## Modules
//!
//! - [`x25519`] : X25519 key agreement (RFC 7748) for per-hop handshakes
//! - [`blake3`] : Domain-separated BLAKE3 key derivation and keyed MACs
//! - [`chacha20`] : ChaCha20-Poly1305 AEAD (RFC 8439) for onion layers

pub mod blake3;
pub mod chacha20;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AEAD encryption or decryption failed (authentication tag mismatch).
    #[error("AEAD operation failed")]
    Aead,

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CryptoError::InvalidInput("short".into());
        assert_eq!(err.to_string(), "invalid input: short");
        assert_eq!(CryptoError::Aead.to_string(), "AEAD operation failed");
    }
}
