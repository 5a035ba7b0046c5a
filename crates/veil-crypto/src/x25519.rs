//! X25519 key agreement (RFC 7748).
//!
//! A relay's identity is one long-lived secret, whose public half the
//! directory publishes. Each hop handshake adds a fresh secret on both
//! sides; those are never stored.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Size in bytes of every X25519 value: secrets, public keys and outputs.
pub const KEY_SIZE: usize = 32;

/// Secret scalar, wiped when dropped.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct X25519StaticSecret {
    inner: StaticSecret,
}

/// Public point, as sent on the wire and stored in the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct X25519PublicKey {
    bytes: [u8; KEY_SIZE],
}

/// Raw agreement output. Feed it to a KDF, never use it as a key directly.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
    bytes: [u8; KEY_SIZE],
}

impl X25519StaticSecret {
    pub fn random() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restore a secret saved with [`X25519StaticSecret::to_bytes`].
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Raw scalar, for persisting an identity. Handle with care.
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.inner.to_bytes()
    }

    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey::from_bytes(PublicKey::from(&self.inner).to_bytes())
    }

    /// Agree on a shared secret with `peer`. Check
    /// [`SharedSecret::is_degenerate`] before using the output.
    pub fn diffie_hellman(&self, peer: &X25519PublicKey) -> SharedSecret {
        let output = self.inner.diffie_hellman(&PublicKey::from(peer.bytes));
        SharedSecret {
            bytes: *output.as_bytes(),
        }
    }
}

impl X25519PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.bytes
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// All-zero output: the peer sent a low-order point.
    pub fn is_degenerate(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(hex_str: &str) -> [u8; KEY_SIZE] {
        let mut out = [0u8; KEY_SIZE];
        out.copy_from_slice(&hex::decode(hex_str).expect("valid hex"));
        out
    }

    #[test]
    fn test_both_sides_agree() {
        let relay = X25519StaticSecret::random();
        let client = X25519StaticSecret::random();
        let at_client = client.diffie_hellman(&relay.public_key());
        let at_relay = relay.diffie_hellman(&client.public_key());
        assert_eq!(at_client.as_bytes(), at_relay.as_bytes());
        assert!(!at_client.is_degenerate());
    }

    #[test]
    fn test_low_order_point_is_degenerate() {
        let secret = X25519StaticSecret::random();
        let zero = X25519PublicKey::from_bytes([0u8; KEY_SIZE]);
        assert!(secret.diffie_hellman(&zero).is_degenerate());
    }

    #[test]
    fn test_saved_secret_keeps_its_public_key() {
        let original = X25519StaticSecret::random();
        let restored = X25519StaticSecret::from_bytes(original.to_bytes());
        assert_eq!(restored.public_key(), original.public_key());
    }

    // RFC 7748, section 6.1.
    #[test]
    fn test_rfc7748_key_agreement_vector() {
        let alice = X25519StaticSecret::from_bytes(key(
            "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a",
        ));
        let bob = X25519StaticSecret::from_bytes(key(
            "5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb",
        ));
        assert_eq!(
            alice.public_key().to_bytes(),
            key("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
        );
        assert_eq!(
            bob.public_key().to_bytes(),
            key("de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f")
        );

        let shared = key("4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742");
        assert_eq!(alice.diffie_hellman(&bob.public_key()).as_bytes(), &shared);
        assert_eq!(bob.diffie_hellman(&alice.public_key()).as_bytes(), &shared);
    }
}
