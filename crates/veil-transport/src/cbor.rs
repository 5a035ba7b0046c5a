//! CBOR serialization helpers for the Veil wire protocol.
//!
//! Thin wrappers over [`ciborium`] that map failures into
//! [`TransportError`]. Decode failures are reported as
//! [`TransportError::MalformedPacket`], since anything that arrives from a
//! peer and does not decode is malformed input.

use serde::{de::DeserializeOwned, Serialize};

use crate::TransportError;

/// Serialize a value to CBOR bytes.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| TransportError::Serialization(format!("CBOR serialization failed: {e}")))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, TransportError> {
    ciborium::from_reader(data)
        .map_err(|e| TransportError::MalformedPacket(format!("CBOR deserialization failed: {e}")))
}
