//! Message vocabulary of the Veil wire protocol.
//!
//! Every envelope is a [`Packet`], tagged by `type` (`directory` or
//! `control`). Inside each type a `command` field names the operation. The
//! enums below are the complete vocabulary: anything else fails to decode.
//!
//! | type | command | fields |
//! |---|---|---|
//! | directory | query | context |
//! | directory | update | address, port, public_key |
//! | directory | answer | registry |
//! | control | create | circuit_id, public_value, relayed |
//! | control | created | circuit_id, public_value, confirmation |
//! | control | relay | circuit_id, direction, payload |
//!
//! Circuit extension never appears at this level. The `extend` request and
//! its `extended` answer travel as a [`RelayBody`] inside the layered
//! payload of a `relay` cell, so only the hop that performs the extension
//! can read the target address.
//!
//! | relay body | fields |
//! |---|---|
//! | forward | payload |
//! | data | payload |
//! | extend | address, port, public_value |
//! | extended | public_value, confirmation |

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use veil_types::{CircuitId, Direction, NodeRegistration};

use crate::{cbor, TransportError};

/// Top-level envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    /// Directory traffic (node registration and registry queries).
    Directory(DirectoryMessage),
    /// Circuit construction and relay cells.
    Control(ControlCell),
}

/// Directory requests and answers.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DirectoryMessage {
    /// Ask for the current registry.
    Query {
        /// Free-form requester context; may be empty.
        #[serde(default)]
        context: String,
    },
    /// Register (or re-register) a node.
    Update {
        address: String,
        port: u16,
        #[serde_as(as = "serde_with::Bytes")]
        public_key: [u8; 32],
    },
    /// The registry, returned for both queries and updates.
    Answer { registry: Vec<NodeRegistration> },
}

/// Control cells exchanged between clients and relays.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCell {
    /// Open a circuit on the receiving relay.
    Create {
        circuit_id: CircuitId,
        /// Initiator's ephemeral X25519 public value.
        #[serde_as(as = "serde_with::Bytes")]
        public_value: [u8; 32],
        /// Set when an extending relay (rather than the client) sends the cell.
        #[serde(default)]
        relayed: bool,
    },
    /// Answer to [`ControlCell::Create`].
    Created {
        circuit_id: CircuitId,
        /// Responder's ephemeral X25519 public value.
        #[serde_as(as = "serde_with::Bytes")]
        public_value: [u8; 32],
        /// Keyed MAC over the handshake transcript.
        #[serde_as(as = "serde_with::Bytes")]
        confirmation: [u8; 32],
    },
    /// Data along an established circuit.
    Relay {
        circuit_id: CircuitId,
        direction: Direction,
        /// Layered ciphertext; each hop removes or adds exactly one layer.
        #[serde_as(as = "serde_with::Bytes")]
        payload: Vec<u8>,
    },
}

/// Plaintext of one layer of a `relay` payload.
///
/// The client builds these from the inside out: the innermost body is the
/// request for the target hop, and every hop before it gets a
/// [`RelayBody::Forward`] wrapping the still-sealed remainder. Inbound
/// answers are a single body under all the hops' layers.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RelayBody {
    /// Pass `payload` unchanged to the next hop.
    Forward {
        #[serde_as(as = "serde_with::Bytes")]
        payload: Vec<u8>,
    },
    /// Application data for the exit, or the exit's answer.
    Data {
        #[serde_as(as = "serde_with::Bytes")]
        payload: Vec<u8>,
    },
    /// Ask this hop to extend the circuit to `address:port`.
    Extend {
        address: String,
        port: u16,
        /// Initiator's ephemeral public value for the new hop.
        #[serde_as(as = "serde_with::Bytes")]
        public_value: [u8; 32],
    },
    /// Answer to [`RelayBody::Extend`], carrying the new hop's `created` fields.
    Extended {
        #[serde_as(as = "serde_with::Bytes")]
        public_value: [u8; 32],
        #[serde_as(as = "serde_with::Bytes")]
        confirmation: [u8; 32],
    },
}

impl RelayBody {
    pub fn command(&self) -> &'static str {
        match self {
            RelayBody::Forward { .. } => "forward",
            RelayBody::Data { .. } => "data",
            RelayBody::Extend { .. } => "extend",
            RelayBody::Extended { .. } => "extended",
        }
    }

    /// CBOR encoding of the body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        cbor::to_vec(self)
    }

    /// Parse a body recovered from under a layer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::MalformedPacket`] for anything that is not
    /// a known relay body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        cbor::from_slice(bytes)
    }
}

impl Packet {
    /// `(type, command)` pair, for logging.
    pub fn kind(&self) -> (&'static str, &'static str) {
        match self {
            Packet::Directory(msg) => ("directory", msg.command()),
            Packet::Control(cell) => ("control", cell.command()),
        }
    }
}

impl DirectoryMessage {
    /// Build an update from a registration.
    pub fn update(registration: &NodeRegistration) -> Self {
        DirectoryMessage::Update {
            address: registration.address.clone(),
            port: registration.port,
            public_key: registration.public_key,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            DirectoryMessage::Query { .. } => "query",
            DirectoryMessage::Update { .. } => "update",
            DirectoryMessage::Answer { .. } => "answer",
        }
    }
}

impl ControlCell {
    pub fn command(&self) -> &'static str {
        match self {
            ControlCell::Create { .. } => "create",
            ControlCell::Created { .. } => "created",
            ControlCell::Relay { .. } => "relay",
        }
    }
}

impl From<DirectoryMessage> for Packet {
    fn from(msg: DirectoryMessage) -> Self {
        Packet::Directory(msg)
    }
}

impl From<ControlCell> for Packet {
    fn from(cell: ControlCell) -> Self {
        Packet::Control(cell)
    }
}
