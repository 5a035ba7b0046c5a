//! Per-hop circuit handshake.
//!
//! The client holds the relay's long-term X25519 key `B` from the directory.
//! For each hop it draws a fresh ephemeral `x` and sends `X`; the relay draws
//! its own ephemeral `y`, replies with `Y` and a confirmation MAC. Both sides
//! compute:
//!
//! ```text
//! transcript   = circuit_id_be || X || Y || B
//! seed         = derive("veil v1 handshake-seed", DH(x,Y) || DH(x,B) || transcript)
//! confirmation = keyed_hash(derive("veil v1 handshake-confirm", seed), transcript)
//! forward      = derive("veil v1 layer-forward", seed)
//! backward     = derive("veil v1 layer-backward", seed)
//! ```
//!
//! Only the holder of `b` can produce a valid confirmation, which binds the
//! hop to the key the directory advertised.

use std::fmt;
use std::io::ErrorKind;
use std::path::Path;

use tracing::info;
use veil_crypto::blake3::{self, contexts};
use veil_crypto::x25519::{X25519PublicKey, X25519StaticSecret};
use veil_types::CircuitId;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CircuitError, Result};

/// Symmetric state shared by a client and one relay of a circuit.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HopSecret {
    seed: [u8; 32],
    forward: [u8; 32],
    backward: [u8; 32],
}

impl HopSecret {
    pub(crate) fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            forward: blake3::derive_key(contexts::LAYER_FORWARD, &seed),
            backward: blake3::derive_key(contexts::LAYER_BACKWARD, &seed),
            seed,
        }
    }

    /// Key for layers travelling from the client toward the exit.
    pub fn forward_key(&self) -> &[u8; 32] {
        &self.forward
    }

    /// Key for layers travelling back toward the client.
    pub fn backward_key(&self) -> &[u8; 32] {
        &self.backward
    }

    /// Short public fingerprint for logs and equality checks in tests.
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::hash(&self.seed)[..8])
    }
}

impl fmt::Debug for HopSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HopSecret")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// A relay's long-term key pair.
#[derive(Clone)]
pub struct RelayIdentity {
    secret: X25519StaticSecret,
    public: X25519PublicKey,
}

impl RelayIdentity {
    /// Generate a fresh identity from the OS RNG.
    pub fn generate() -> Self {
        Self::from_secret(X25519StaticSecret::random())
    }

    fn from_secret(secret: X25519StaticSecret) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Load the identity kept at `path` (the secret key, hex encoded), or
    /// create one there if the file does not exist yet. A relay that keeps
    /// its identity re-registers under the same key after a restart.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Identity`] if the file cannot be read, does
    /// not hold a 32-byte hex key, or cannot be written.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        let identity_error = |what: &str, e: &dyn fmt::Display| {
            CircuitError::Identity(format!("{what} {}: {e}", path.display()))
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let bytes = hex::decode(contents.trim())
                    .map_err(|e| identity_error("decode", &e))?;
                let secret: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
                    identity_error("decode", &format!("{} bytes, expected 32", bytes.len()))
                })?;
                let identity = Self::from_secret(X25519StaticSecret::from_bytes(secret));
                info!(path = %path.display(), "loaded relay identity");
                Ok(identity)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let identity = Self::generate();
                let mut encoded = hex::encode(identity.secret.to_bytes());
                std::fs::write(path, &encoded).map_err(|e| identity_error("write", &e))?;
                encoded.zeroize();
                info!(path = %path.display(), "created relay identity");
                Ok(identity)
            }
            Err(e) => Err(identity_error("read", &e)),
        }
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.public
    }
}

impl fmt::Debug for RelayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayIdentity")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Client half of a handshake in progress.
pub struct ClientHandshake {
    circuit_id: CircuitId,
    ephemeral: X25519StaticSecret,
    relay_static: X25519PublicKey,
}

/// What a relay sends back and keeps after answering a handshake.
pub struct RelayReply {
    pub public_value: X25519PublicKey,
    pub confirmation: [u8; 32],
    pub secret: HopSecret,
}

/// Start a handshake with the relay whose long-term key is `relay_static`.
///
/// Returns the pending state and the public value to send.
pub fn initiate(
    circuit_id: CircuitId,
    relay_static: X25519PublicKey,
) -> (ClientHandshake, X25519PublicKey) {
    let ephemeral = X25519StaticSecret::random();
    let public = ephemeral.public_key();
    (
        ClientHandshake {
            circuit_id,
            ephemeral,
            relay_static,
        },
        public,
    )
}

impl ClientHandshake {
    /// Finish the handshake with the relay's reply.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::HandshakeFailed`] if a Diffie-Hellman output is
    /// degenerate or the confirmation does not verify.
    pub fn complete(
        self,
        relay_public: &X25519PublicKey,
        confirmation: &[u8; 32],
    ) -> Result<HopSecret> {
        let ephemeral_shared = self.ephemeral.diffie_hellman(relay_public);
        let static_shared = self.ephemeral.diffie_hellman(&self.relay_static);
        if ephemeral_shared.is_degenerate() || static_shared.is_degenerate() {
            return Err(CircuitError::HandshakeFailed(
                "degenerate key agreement".into(),
            ));
        }
        let transcript = transcript(
            self.circuit_id,
            &self.ephemeral.public_key(),
            relay_public,
            &self.relay_static,
        );
        let seed = derive_seed(
            ephemeral_shared.as_bytes(),
            static_shared.as_bytes(),
            &transcript,
        );
        let confirm_key = blake3::derive_key(contexts::HANDSHAKE_CONFIRM, &seed);
        if !blake3::verify_keyed_hash(&confirm_key, &transcript, confirmation) {
            return Err(CircuitError::HandshakeFailed(format!(
                "confirmation mismatch on circuit {}",
                self.circuit_id
            )));
        }
        Ok(HopSecret::from_seed(seed))
    }
}

/// Answer a client's handshake for `circuit_id`.
///
/// # Errors
///
/// Returns [`CircuitError::HandshakeFailed`] if the client's public value
/// yields a degenerate shared secret.
pub fn respond(
    identity: &RelayIdentity,
    circuit_id: CircuitId,
    client_public: &X25519PublicKey,
) -> Result<RelayReply> {
    let ephemeral = X25519StaticSecret::random();
    let public_value = ephemeral.public_key();
    let ephemeral_shared = ephemeral.diffie_hellman(client_public);
    let static_shared = identity.secret.diffie_hellman(client_public);
    if ephemeral_shared.is_degenerate() || static_shared.is_degenerate() {
        return Err(CircuitError::HandshakeFailed(
            "degenerate key agreement".into(),
        ));
    }
    let transcript = transcript(circuit_id, client_public, &public_value, &identity.public);
    let seed = derive_seed(
        ephemeral_shared.as_bytes(),
        static_shared.as_bytes(),
        &transcript,
    );
    let confirm_key = blake3::derive_key(contexts::HANDSHAKE_CONFIRM, &seed);
    Ok(RelayReply {
        public_value,
        confirmation: blake3::keyed_hash(&confirm_key, &transcript),
        secret: HopSecret::from_seed(seed),
    })
}

fn transcript(
    circuit_id: CircuitId,
    client: &X25519PublicKey,
    relay_ephemeral: &X25519PublicKey,
    relay_static: &X25519PublicKey,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 3 * 32);
    out.extend_from_slice(&circuit_id.to_be_bytes());
    out.extend_from_slice(client.as_bytes());
    out.extend_from_slice(relay_ephemeral.as_bytes());
    out.extend_from_slice(relay_static.as_bytes());
    out
}

fn derive_seed(ephemeral: &[u8; 32], static_: &[u8; 32], transcript: &[u8]) -> [u8; 32] {
    let mut material = Vec::with_capacity(64 + transcript.len());
    material.extend_from_slice(ephemeral);
    material.extend_from_slice(static_);
    material.extend_from_slice(transcript);
    let seed = blake3::derive_key(contexts::HANDSHAKE_SEED, &material);
    material.zeroize();
    seed
}
