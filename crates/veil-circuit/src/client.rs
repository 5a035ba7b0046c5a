//! Onion client.
//!
//! Fetches the registry from a directory, selects a path, builds circuits
//! through the [`CircuitBuilder`] and exchanges payloads over them. Every
//! circuit gets its own connection to its entry relay.

use std::net::SocketAddr;

use tracing::{debug, info};
use veil_directory::DirectoryClient;
use veil_transport::quic;
use veil_transport::{ControlCell, Packet, QuicNode, RelayBody};
use veil_types::{CircuitId, Direction, NodeRegistration};

use crate::builder::CircuitBuilder;
use crate::layer;
use crate::selection::select_path;
use crate::table::{CircuitTable, ClientCircuit, SenderKeyLedger};
use crate::{CircuitConfig, CircuitError, Result};

/// Close code for a circuit closed by its owner.
const CIRCUIT_CLOSED_CODE: u32 = 0;

/// A client that builds and uses circuits.
pub struct OnionClient {
    quic: QuicNode,
    circuits: CircuitTable<ClientCircuit>,
    ledger: SenderKeyLedger,
    config: CircuitConfig,
}

impl OnionClient {
    /// Create a client with its own QUIC endpoint on `bind_addr`.
    ///
    /// # Errors
    ///
    /// Returns a network error if the endpoint cannot be bound.
    pub fn new(bind_addr: SocketAddr, config: CircuitConfig) -> Result<Self> {
        Ok(Self {
            quic: QuicNode::client(bind_addr)?,
            circuits: CircuitTable::new(),
            ledger: SenderKeyLedger::new(),
            config,
        })
    }

    /// Fetch the registry from the directory at `directory`.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Directory`] when the directory cannot be reached.
    pub async fn fetch_directory(&self, directory: SocketAddr) -> Result<Vec<NodeRegistration>> {
        let client = DirectoryClient::new(directory)
            .with_timeout(self.config.handshake_timeout)
            .with_max_attempts(self.config.max_attempts);
        Ok(client.query(&self.quic).await?)
    }

    /// Fetch the registry, pick `hops` relays and build a circuit through them.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::InsufficientNodes`] before any circuit traffic
    /// if the registry is too small, otherwise as [`OnionClient::build_circuit`].
    pub async fn connect(&self, directory: SocketAddr, hops: usize) -> Result<CircuitId> {
        let registry = self.fetch_directory(directory).await?;
        let path = select_path(&registry, hops)?;
        self.build_circuit(&path).await
    }

    /// Build a circuit through `path` (entry first).
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::CircuitBuild`] naming the hop that failed; no
    /// client-side state is left behind in that case.
    pub async fn build_circuit(&self, path: &[NodeRegistration]) -> Result<CircuitId> {
        CircuitBuilder::new(&self.quic, &self.circuits, &self.ledger, &self.config)
            .build(path)
            .await
    }

    /// Send `data` to the exit of `circuit_id` and return the exit's answer.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::UnknownCircuit`] if the circuit is not built,
    /// and network or crypto errors from the exchange.
    pub async fn send(&self, circuit_id: CircuitId, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let hops = self
            .ledger
            .hops(circuit_id)
            .ok_or(CircuitError::UnknownCircuit(circuit_id))?;
        let entry = self
            .circuits
            .get(circuit_id)
            .and_then(|c| c.entry)
            .ok_or(CircuitError::UnknownCircuit(circuit_id))?;

        let body = RelayBody::Data {
            payload: data.to_vec(),
        };
        let onion = layer::seal_onion(&hops, circuit_id, &body)?;
        let cell = Packet::Control(ControlCell::Relay {
            circuit_id,
            direction: Direction::Outbound,
            payload: onion,
        });
        debug!(circuit = %circuit_id, bytes = data.len(), "sending relay cell");

        match quic::exchange(&entry, &cell, self.config.handshake_timeout).await? {
            None => Ok(None),
            Some(Packet::Control(ControlCell::Relay {
                circuit_id: id,
                direction: Direction::Inbound,
                payload,
            })) if id == circuit_id => match layer::peel_onion(&hops, circuit_id, &payload)? {
                RelayBody::Data { payload } => Ok(Some(payload)),
                other => Err(CircuitError::ProtocolViolation(format!(
                    "exit answered data with a {} body",
                    other.command()
                ))),
            },
            Some(other) => {
                let (kind, command) = other.kind();
                Err(CircuitError::ProtocolViolation(format!(
                    "entry answered relay with {kind}/{command}"
                )))
            }
        }
    }

    /// Forget a circuit and close its entry connection. Returns whether the
    /// circuit existed. The entry forgets the circuit once its connection is
    /// gone, and each relay after it follows when its link closes.
    pub fn close_circuit(&self, circuit_id: CircuitId) -> bool {
        self.ledger.remove(circuit_id);
        match self.circuits.remove(circuit_id) {
            Some(circuit) => {
                if let Some(conn) = circuit.entry {
                    conn.close(CIRCUIT_CLOSED_CODE.into(), b"circuit closed");
                }
                info!(circuit = %circuit_id, "circuit closed");
                true
            }
            None => false,
        }
    }

    /// Relays of `circuit_id`, entry first.
    pub fn path(&self, circuit_id: CircuitId) -> Option<Vec<NodeRegistration>> {
        self.circuits.get(circuit_id).map(|c| c.path)
    }

    pub fn ledger(&self) -> &SenderKeyLedger {
        &self.ledger
    }

    pub fn circuits(&self) -> &CircuitTable<ClientCircuit> {
        &self.circuits
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.quic.local_addr()
    }
}
