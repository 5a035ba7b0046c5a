//! Domain-separated BLAKE3 hashing for the Veil protocol.
//!
//! Handshake seeds, confirmation MACs, and onion layer keys are all derived
//! with BLAKE3's key derivation mode under a registered context string, so a
//! value derived for one purpose can never be reused for another.

/// Registered BLAKE3 context strings.
pub mod contexts {
    pub const HANDSHAKE_SEED: &str = "veil v1 handshake-seed";
    pub const HANDSHAKE_CONFIRM: &str = "veil v1 handshake-confirm";
    pub const LAYER_FORWARD: &str = "veil v1 layer-forward";
    pub const LAYER_BACKWARD: &str = "veil v1 layer-backward";

    /// All registered context strings.
    pub const ALL_CONTEXTS: &[&str] = &[
        HANDSHAKE_SEED,
        HANDSHAKE_CONFIRM,
        LAYER_FORWARD,
        LAYER_BACKWARD,
    ];
}

/// Compute BLAKE3 hash of the input data.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Derive a key using BLAKE3's built-in key derivation mode.
///
/// `context` must be one of [`contexts::ALL_CONTEXTS`].
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    let mut hasher = ::blake3::Hasher::new_derive_key(context);
    hasher.update(key_material);
    *hasher.finalize().as_bytes()
}

/// Compute a keyed BLAKE3 hash (MAC/PRF).
pub fn keyed_hash(key: &[u8; 32], message: &[u8]) -> [u8; 32] {
    *::blake3::keyed_hash(key, message).as_bytes()
}

/// Check a keyed BLAKE3 MAC in constant time.
pub fn verify_keyed_hash(key: &[u8; 32], message: &[u8], expected: &[u8; 32]) -> bool {
    ::blake3::keyed_hash(key, message) == ::blake3::Hash::from(*expected)
}
