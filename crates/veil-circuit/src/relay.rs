//! Forwarding of relay cells along established circuits.
//!
//! A relay only ever touches its own layer: outbound it removes one layer
//! with its forward key, inbound it adds one with its backward key. What is
//! under the layer decides the rest: a `forward` body goes to the next hop,
//! a `data` body goes to the exit application and an `extend` body is
//! handed back to the [`Switchboard`](crate::switchboard::Switchboard),
//! which owns handshakes and connections. Cells for circuits the relay does
//! not know are dropped without a reply.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};
use veil_transport::quic;
use veil_transport::{ControlCell, Packet, RelayBody};
use veil_types::{CircuitId, Direction};

use crate::layer;
use crate::table::NodeTables;
use crate::{CircuitError, Result};

/// Application behind the exit hop.
pub trait ExitHandler: Send + Sync {
    /// Handle a fully unwrapped payload. `Some` is sent back to the client.
    fn handle(&self, circuit_id: CircuitId, payload: Vec<u8>) -> Option<Vec<u8>>;
}

/// Exit handler that returns every payload unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoExit;

impl ExitHandler for EchoExit {
    fn handle(&self, _circuit_id: CircuitId, payload: Vec<u8>) -> Option<Vec<u8>> {
        Some(payload)
    }
}

/// Target and key material of an `extend` addressed to this hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendRequest {
    pub address: String,
    pub port: u16,
    pub public_value: [u8; 32],
}

/// Result of handling one relay cell.
#[derive(Debug)]
pub enum Outcome {
    /// Answer to send back on the stream, if any.
    Reply(Option<Packet>),
    /// The cell asks this hop to extend the circuit.
    Extend(ExtendRequest),
}

/// Relay-cell processing for one node.
#[derive(Clone)]
pub struct IntermediateRelay {
    tables: Arc<NodeTables>,
    exit: Arc<dyn ExitHandler>,
    forward_timeout: Duration,
}

impl IntermediateRelay {
    pub fn new(
        tables: Arc<NodeTables>,
        exit: Arc<dyn ExitHandler>,
        forward_timeout: Duration,
    ) -> Self {
        Self {
            tables,
            exit,
            forward_timeout,
        }
    }

    /// Process one relay cell.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Crypto`] if the payload does not carry a layer
    /// for this hop, [`CircuitError::ProtocolViolation`] for a body this hop
    /// cannot act on, and network errors from forwarding.
    pub async fn handle(
        &self,
        circuit_id: CircuitId,
        direction: Direction,
        payload: Vec<u8>,
    ) -> Result<Outcome> {
        let (Some(linkage), Some(secret)) = (
            self.tables.circuits.get(circuit_id),
            self.tables.keys.get(circuit_id),
        ) else {
            debug!(circuit = %circuit_id, %direction, "dropping cell for unknown circuit");
            return Ok(Outcome::Reply(None));
        };

        match direction {
            Direction::Outbound => {
                let body = layer::open_layer(&secret, circuit_id, &payload)?;
                match (body, linkage.next_hop) {
                    (RelayBody::Forward { payload }, Some(_)) => {
                        let reply = match self.forward(circuit_id, payload).await? {
                            Some(data) => Some(inbound_cell(
                                circuit_id,
                                layer::wrap(
                                    secret.backward_key(),
                                    circuit_id,
                                    Direction::Inbound,
                                    &data,
                                )?,
                            )),
                            None => None,
                        };
                        Ok(Outcome::Reply(reply))
                    }
                    (RelayBody::Data { payload }, None) => {
                        trace!(circuit = %circuit_id, bytes = payload.len(), "exit delivery");
                        self.exit
                            .handle(circuit_id, payload)
                            .map(|payload| self.answer(circuit_id, &RelayBody::Data { payload }))
                            .transpose()
                            .map(Outcome::Reply)
                    }
                    (
                        RelayBody::Extend {
                            address,
                            port,
                            public_value,
                        },
                        _,
                    ) => Ok(Outcome::Extend(ExtendRequest {
                        address,
                        port,
                        public_value,
                    })),
                    (body, next_hop) => Err(CircuitError::ProtocolViolation(format!(
                        "{} body for circuit {circuit_id} at a hop with next hop {next_hop:?}",
                        body.command()
                    ))),
                }
            }
            Direction::Inbound => {
                let wrapped = layer::wrap(secret.backward_key(), circuit_id, direction, &payload)?;
                if linkage.previous_hop.is_none() {
                    debug!(circuit = %circuit_id, "inbound cell terminates at entry");
                    return Ok(Outcome::Reply(None));
                }
                let toward_client = self
                    .tables
                    .relays
                    .get(circuit_id)
                    .and_then(|links| links.toward_client);
                match toward_client {
                    Some(conn) => {
                        let cell = inbound_cell(circuit_id, wrapped);
                        quic::push(&conn, &cell, self.forward_timeout).await?;
                    }
                    None => {
                        warn!(circuit = %circuit_id, "no connection toward client, dropping cell")
                    }
                }
                Ok(Outcome::Reply(None))
            }
        }
    }

    /// Seal `body` under this hop's inbound layer as a reply cell.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::UnknownCircuit`] if the circuit was forgotten
    /// meanwhile.
    pub fn answer(&self, circuit_id: CircuitId, body: &RelayBody) -> Result<Packet> {
        let secret = self
            .tables
            .keys
            .get(circuit_id)
            .ok_or(CircuitError::UnknownCircuit(circuit_id))?;
        let payload = layer::close_layer(&secret, circuit_id, body)?;
        Ok(inbound_cell(circuit_id, payload))
    }

    /// Send `inner` to the next hop and return the payload of its inbound
    /// answer, if it gave one.
    async fn forward(&self, circuit_id: CircuitId, inner: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let Some(conn) = self
            .tables
            .relays
            .get(circuit_id)
            .and_then(|links| links.toward_exit)
        else {
            warn!(circuit = %circuit_id, "next hop recorded without a connection, dropping cell");
            return Ok(None);
        };
        let cell = Packet::Control(ControlCell::Relay {
            circuit_id,
            direction: Direction::Outbound,
            payload: inner,
        });
        match quic::exchange(&conn, &cell, self.forward_timeout).await? {
            None => Ok(None),
            Some(Packet::Control(ControlCell::Relay {
                circuit_id: id,
                direction: Direction::Inbound,
                payload,
            })) if id == circuit_id => Ok(Some(payload)),
            Some(other) => {
                let (kind, command) = other.kind();
                Err(CircuitError::ProtocolViolation(format!(
                    "next hop answered relay with {kind}/{command}"
                )))
            }
        }
    }
}

fn inbound_cell(circuit_id: CircuitId, payload: Vec<u8>) -> Packet {
    Packet::Control(ControlCell::Relay {
        circuit_id,
        direction: Direction::Inbound,
        payload,
    })
}
