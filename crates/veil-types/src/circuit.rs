//! Circuit identifiers and cell directions.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Opaque circuit identifier chosen by the circuit's originator.
///
/// The same identifier names the circuit on every hop. Identifiers are drawn
/// uniformly from the 64-bit space, so two live circuits colliding on one
/// relay is negligible and not resolved on the relay side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CircuitId(pub u64);

impl CircuitId {
    /// Draw a random identifier from the OS RNG.
    pub fn random() -> Self {
        Self(rand::rngs::OsRng.next_u64())
    }

    /// Big-endian encoding, used as associated data and in handshake transcripts.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for CircuitId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Direction a relay cell travels along a circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// From the client toward the exit hop.
    Outbound,
    /// From the exit hop back toward the client.
    Inbound,
}

impl Direction {
    /// Single-byte tag bound into each layer's associated data.
    pub fn tag(self) -> u8 {
        match self {
            Self::Outbound => 0x01,
            Self::Inbound => 0x02,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => f.write_str("outbound"),
            Self::Inbound => f.write_str("inbound"),
        }
    }
}
