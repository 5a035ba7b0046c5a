//! Hop-by-hop circuit construction.
//!
//! The builder connects to the entry relay and sends `create`, then grows the
//! circuit one hop at a time. The `extend` for hop `i` is a relay body
//! sealed for hop `i - 1` under the layers of every hop before it, so each
//! relay on the way sees only a `forward` and only the current last hop
//! learns the new target. Hop `i + 1` is never attempted before hop `i` has
//! completed.
//!
//! Each hop gets `max_attempts` attempts, each bounded by
//! `handshake_timeout` and each with a fresh ephemeral key. When a hop runs
//! out of attempts the build fails and leaves no client-side trace: the
//! ledger entry and circuit entry are removed and the entry connection is
//! closed. Closing it makes the entry forget the partial circuit, and the
//! teardown continues hop by hop along the links it had opened.

use quinn::Connection;
use tracing::{debug, info, warn};
use veil_crypto::x25519::X25519PublicKey;
use veil_transport::quic;
use veil_transport::{ControlCell, Packet, QuicNode, RelayBody};
use veil_types::{CircuitId, Direction, NodeRegistration};

use crate::handshake::{self, HopSecret};
use crate::layer;
use crate::table::{CircuitTable, ClientCircuit, SenderKeyLedger};
use crate::{CircuitConfig, CircuitError, Result};

/// Close code for an entry connection abandoned by a failed build.
const BUILD_FAILED_CODE: u32 = 2;

/// Builds circuits against the client's tables.
pub struct CircuitBuilder<'a> {
    quic: &'a QuicNode,
    circuits: &'a CircuitTable<ClientCircuit>,
    ledger: &'a SenderKeyLedger,
    config: &'a CircuitConfig,
}

impl<'a> CircuitBuilder<'a> {
    pub fn new(
        quic: &'a QuicNode,
        circuits: &'a CircuitTable<ClientCircuit>,
        ledger: &'a SenderKeyLedger,
        config: &'a CircuitConfig,
    ) -> Self {
        Self {
            quic,
            circuits,
            ledger,
            config,
        }
    }

    /// Build a circuit through `path` (entry first).
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::InsufficientNodes`] for an empty path and
    /// [`CircuitError::CircuitBuild`] naming the first hop that could not be
    /// established.
    pub async fn build(&self, path: &[NodeRegistration]) -> Result<CircuitId> {
        if path.is_empty() {
            return Err(CircuitError::InsufficientNodes { need: 1, have: 0 });
        }

        let circuit_id = self.allocate(path);
        let mut entry: Option<Connection> = None;

        for (hop, node) in path.iter().enumerate() {
            match self.establish_hop(circuit_id, hop, node, &mut entry).await {
                Ok(secret) => {
                    debug!(
                        circuit = %circuit_id,
                        hop,
                        secret = %secret.fingerprint(),
                        "hop established"
                    );
                    self.ledger.append(circuit_id, secret);
                    if hop == 0 {
                        let conn = entry.clone();
                        self.circuits.update(circuit_id, move |c| c.entry = conn);
                    }
                }
                Err(e) => {
                    self.rollback(circuit_id, entry.take());
                    warn!(circuit = %circuit_id, hop, "circuit build failed: {e}");
                    return Err(CircuitError::CircuitBuild {
                        hop,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(circuit = %circuit_id, hops = path.len(), "circuit built");
        Ok(circuit_id)
    }

    /// Reserve a process-unique id and its ledger entry.
    fn allocate(&self, path: &[NodeRegistration]) -> CircuitId {
        loop {
            let id = CircuitId::random();
            let circuit = ClientCircuit {
                path: path.to_vec(),
                entry: None,
            };
            if self.circuits.insert_if_absent(id, circuit) {
                self.ledger.open(id);
                return id;
            }
        }
    }

    fn rollback(&self, circuit_id: CircuitId, entry: Option<Connection>) {
        self.ledger.remove(circuit_id);
        self.circuits.remove(circuit_id);
        if let Some(conn) = entry {
            conn.close(BUILD_FAILED_CODE.into(), b"circuit build failed");
        }
    }

    async fn establish_hop(
        &self,
        circuit_id: CircuitId,
        hop: usize,
        node: &NodeRegistration,
        entry: &mut Option<Connection>,
    ) -> Result<HopSecret> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = CircuitError::Network("no attempt made".into());
        for attempt in 1..=attempts {
            let result = tokio::time::timeout(
                self.config.handshake_timeout,
                self.attempt_hop(circuit_id, hop, node, entry),
            )
            .await;
            match result {
                Ok(Ok(secret)) => return Ok(secret),
                Ok(Err(e)) => last_error = e,
                Err(_) => {
                    last_error = CircuitError::Network(format!(
                        "no answer within {} ms",
                        self.config.handshake_timeout.as_millis()
                    ))
                }
            }
            debug!(
                circuit = %circuit_id,
                hop,
                attempt,
                max_attempts = attempts,
                "hop attempt failed: {last_error}"
            );
        }
        Err(last_error)
    }

    async fn attempt_hop(
        &self,
        circuit_id: CircuitId,
        hop: usize,
        node: &NodeRegistration,
        entry: &mut Option<Connection>,
    ) -> Result<HopSecret> {
        let relay_static = X25519PublicKey::from_bytes(node.public_key);
        let (pending, public) = handshake::initiate(circuit_id, relay_static);
        let (relay_public, confirmation) = if hop == 0 {
            self.create_entry(circuit_id, node, public, entry).await?
        } else {
            let conn = entry
                .clone()
                .ok_or(CircuitError::UnknownCircuit(circuit_id))?;
            self.extend(&conn, circuit_id, hop, node, public).await?
        };
        pending.complete(&X25519PublicKey::from_bytes(relay_public), &confirmation)
    }

    async fn create_entry(
        &self,
        circuit_id: CircuitId,
        node: &NodeRegistration,
        public: X25519PublicKey,
        entry: &mut Option<Connection>,
    ) -> Result<([u8; 32], [u8; 32])> {
        let reusable = entry
            .as_ref()
            .filter(|conn| conn.close_reason().is_none())
            .cloned();
        let conn = match reusable {
            Some(conn) => conn,
            None => {
                let addr = node
                    .socket_addr()
                    .map_err(|e| CircuitError::Network(e.to_string()))?;
                let conn = self.quic.connect(addr).await?;
                *entry = Some(conn.clone());
                conn
            }
        };
        let request = Packet::Control(ControlCell::Create {
            circuit_id,
            public_value: public.to_bytes(),
            relayed: false,
        });
        match quic::request(&conn, &request, self.config.handshake_timeout).await? {
            Packet::Control(ControlCell::Created {
                circuit_id: id,
                public_value,
                confirmation,
            }) if id == circuit_id => Ok((public_value, confirmation)),
            other => {
                let (kind, command) = other.kind();
                Err(CircuitError::ProtocolViolation(format!(
                    "unexpected {kind}/{command} while building hop 0"
                )))
            }
        }
    }

    /// Ask the current last hop, through the layers of every hop so far,
    /// to extend the circuit to `node`.
    async fn extend(
        &self,
        conn: &Connection,
        circuit_id: CircuitId,
        hop: usize,
        node: &NodeRegistration,
        public: X25519PublicKey,
    ) -> Result<([u8; 32], [u8; 32])> {
        let hops = self
            .ledger
            .hops(circuit_id)
            .ok_or(CircuitError::UnknownCircuit(circuit_id))?;
        let request = RelayBody::Extend {
            address: node.address.clone(),
            port: node.port,
            public_value: public.to_bytes(),
        };
        let cell = Packet::Control(ControlCell::Relay {
            circuit_id,
            direction: Direction::Outbound,
            payload: layer::seal_onion(&hops, circuit_id, &request)?,
        });

        let payload = match quic::exchange(conn, &cell, self.config.handshake_timeout).await? {
            Some(Packet::Control(ControlCell::Relay {
                circuit_id: id,
                direction: Direction::Inbound,
                payload,
            })) if id == circuit_id => payload,
            Some(other) => {
                let (kind, command) = other.kind();
                return Err(CircuitError::ProtocolViolation(format!(
                    "unexpected {kind}/{command} while building hop {hop}"
                )));
            }
            None => {
                return Err(CircuitError::Network(format!(
                    "extend to hop {hop} went unanswered"
                )))
            }
        };
        match layer::peel_onion(&hops, circuit_id, &payload)? {
            RelayBody::Extended {
                public_value,
                confirmation,
            } => Ok((public_value, confirmation)),
            other => Err(CircuitError::ProtocolViolation(format!(
                "unexpected {} body while building hop {hop}",
                other.command()
            ))),
        }
    }
}
