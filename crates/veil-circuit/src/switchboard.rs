//! Per-stream dispatch of control cells on a relay.
//!
//! Every bidirectional stream carries one request envelope. The switchboard
//! reads it (bounded by the I/O timeout), answers `create` itself and hands
//! `relay` cells to the [`IntermediateRelay`]. An `extend` found under this
//! hop's layer comes back here: the switchboard opens the link to the next
//! hop and runs the `create` there. A request that fails to decode or is
//! not acceptable on a relay resets only its own stream: the connection,
//! and every other circuit multiplexed on it, is left alone.
//!
//! When a connection ends, every circuit running over it is forgotten and
//! its other link closed, so the loss travels along the circuit.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use quinn::{Connection, RecvStream, SendStream};
use tracing::{debug, info, warn};
use veil_crypto::x25519::X25519PublicKey;
use veil_transport::quic;
use veil_transport::{ControlCell, Packet, QuicNode, RelayBody, StopFlag};
use veil_types::{CircuitId, NodeRegistration};

use crate::handshake::{self, RelayIdentity};
use crate::relay::{ExtendRequest, IntermediateRelay, Outcome};
use crate::table::{HopLinkage, NodeTables, RelayLinks};
use crate::{CircuitConfig, CircuitError, Result};

/// Application error code used when a request is rejected.
const REJECT_CODE: u32 = 1;

/// Close code for a next-hop link whose `create` did not complete.
const EXTEND_FAILED_CODE: u32 = 4;

/// Shared dispatch state of one relay node.
#[derive(Clone)]
pub struct Switchboard {
    identity: Arc<RelayIdentity>,
    quic: Arc<QuicNode>,
    tables: Arc<NodeTables>,
    relay: IntermediateRelay,
    config: CircuitConfig,
    stop: StopFlag,
}

impl Switchboard {
    pub fn new(
        identity: Arc<RelayIdentity>,
        quic: Arc<QuicNode>,
        tables: Arc<NodeTables>,
        relay: IntermediateRelay,
        config: CircuitConfig,
        stop: StopFlag,
    ) -> Self {
        Self {
            identity,
            quic,
            tables,
            relay,
            config,
            stop,
        }
    }

    /// Serve every stream the peer opens on `conn` until the connection
    /// closes or the node stops. A closed connection takes the circuits
    /// running over it along.
    ///
    /// Boxed because serving a stream can open a next-hop link, which is
    /// served by this same function.
    pub fn serve_connection(self, conn: Connection) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let peer = conn.remote_address();
            while !self.stop.is_stopped() {
                let accepted =
                    tokio::time::timeout(self.config.io_timeout, QuicNode::accept_bi(&conn)).await;
                let (send, recv) = match accepted {
                    Err(_) => continue,
                    Ok(Err(_)) => {
                        let forgotten = self.tables.forget_connection(conn.stable_id());
                        if !forgotten.is_empty() {
                            info!(
                                %peer,
                                circuits = forgotten.len(),
                                "link lost, circuits forgotten"
                            );
                        }
                        break;
                    }
                    Ok(Ok(streams)) => streams,
                };
                let board = self.clone();
                let conn = conn.clone();
                tokio::spawn(async move { board.serve_stream(conn, send, recv).await });
            }
            debug!(%peer, "connection closed");
        })
    }

    async fn serve_stream(self, conn: Connection, mut send: SendStream, mut recv: RecvStream) {
        let peer = conn.remote_address();
        let outcome = match quic::within(self.config.io_timeout, QuicNode::recv_packet(&mut recv))
            .await
        {
            Ok(packet) => self.dispatch(&conn, packet).await,
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(reply) => {
                if let Some(reply) = reply {
                    if let Err(e) = QuicNode::send_packet(&mut send, &reply).await {
                        debug!(%peer, "failed to send reply: {e}");
                        return;
                    }
                }
                let _ = send.finish();
            }
            Err(e) => {
                match &e {
                    CircuitError::MalformedPacket(_) | CircuitError::ProtocolViolation(_) => {
                        warn!(%peer, "rejected request: {e}")
                    }
                    _ => debug!(%peer, "request failed: {e}"),
                }
                let code = quinn::VarInt::from_u32(REJECT_CODE);
                let _ = send.reset(code);
                let _ = recv.stop(code);
            }
        }
    }

    /// Handle one decoded request received on `conn`.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::ProtocolViolation`] for cells a relay never
    /// accepts, plus whatever handling the cell produces.
    pub async fn dispatch(&self, conn: &Connection, packet: Packet) -> Result<Option<Packet>> {
        match packet {
            Packet::Control(ControlCell::Create {
                circuit_id,
                public_value,
                relayed,
            }) => self
                .handle_create(conn, circuit_id, public_value, relayed)
                .map(Some),
            Packet::Control(ControlCell::Relay {
                circuit_id,
                direction,
                payload,
            }) => match self.relay.handle(circuit_id, direction, payload).await? {
                Outcome::Reply(reply) => Ok(reply),
                Outcome::Extend(request) => {
                    let extended = self.handle_extend(circuit_id, request).await?;
                    self.relay.answer(circuit_id, &extended).map(Some)
                }
            },
            other => {
                let (kind, command) = other.kind();
                Err(CircuitError::ProtocolViolation(format!(
                    "relay does not accept unsolicited {kind}/{command}"
                )))
            }
        }
    }

    /// Answer a handshake and install the circuit. All three tables are
    /// written before the reply leaves.
    fn handle_create(
        &self,
        conn: &Connection,
        circuit_id: CircuitId,
        public_value: [u8; 32],
        relayed: bool,
    ) -> Result<Packet> {
        let reply = handshake::respond(
            &self.identity,
            circuit_id,
            &X25519PublicKey::from_bytes(public_value),
        )?;
        let previous_hop = relayed.then(|| conn.remote_address());

        self.tables.circuits.put(
            circuit_id,
            HopLinkage {
                previous_hop,
                next_hop: None,
            },
        );
        self.tables.keys.put(circuit_id, reply.secret.clone());
        let replaced = self.tables.relays.put(
            circuit_id,
            RelayLinks {
                toward_client: Some(conn.clone()),
                toward_exit: None,
            },
        );
        // A repeated create starts the circuit over from this hop.
        if let Some(previous) = replaced {
            self.tables.release(previous);
        }
        info!(
            circuit = %circuit_id,
            previous = ?previous_hop,
            "circuit created"
        );

        Ok(Packet::Control(ControlCell::Created {
            circuit_id,
            public_value: reply.public_value.to_bytes(),
            confirmation: reply.confirmation,
        }))
    }

    /// Extend the circuit from this hop. Repeating the extend that made the
    /// current next hop reuses its link; any other target is refused once
    /// the circuit has a next hop.
    async fn handle_extend(
        &self,
        circuit_id: CircuitId,
        request: ExtendRequest,
    ) -> Result<RelayBody> {
        let linkage = self
            .tables
            .circuits
            .get(circuit_id)
            .ok_or(CircuitError::UnknownCircuit(circuit_id))?;
        let target = NodeRegistration::new(request.address, request.port, [0u8; 32])
            .socket_addr()
            .map_err(|e| CircuitError::ProtocolViolation(e.to_string()))?;
        let links = self.tables.relays.get(circuit_id).unwrap_or_default();

        let reusable = match linkage.next_hop {
            None => None,
            Some(next) if next == target => links
                .toward_exit
                .filter(|conn| conn.close_reason().is_none()),
            Some(next) => {
                return Err(CircuitError::ProtocolViolation(format!(
                    "circuit {circuit_id} already extends to {next}"
                )))
            }
        };
        let (conn, fresh) = match reusable {
            Some(conn) => (conn, false),
            None => (self.connect_next_hop(target).await?, true),
        };

        let created = self.create_at(&conn, circuit_id, request.public_value).await;
        let abandon = |conn: &Connection| {
            if fresh {
                conn.close(EXTEND_FAILED_CODE.into(), b"extend failed");
            }
        };
        let (public_value, confirmation) = match created {
            Ok(created) => created,
            Err(e) => {
                abandon(&conn);
                return Err(e);
            }
        };

        let linked = self.tables.relays.update(circuit_id, |r| {
            r.toward_exit = Some(conn.clone());
        });
        if !linked {
            abandon(&conn);
            return Err(CircuitError::UnknownCircuit(circuit_id));
        }
        self.tables
            .circuits
            .update(circuit_id, |l| l.next_hop = Some(target));
        info!(circuit = %circuit_id, next = %target, reused = !fresh, "circuit extended");

        Ok(RelayBody::Extended {
            public_value,
            confirmation,
        })
    }

    /// Run the `create` for an extension over `conn`.
    async fn create_at(
        &self,
        conn: &Connection,
        circuit_id: CircuitId,
        public_value: [u8; 32],
    ) -> Result<([u8; 32], [u8; 32])> {
        let request = Packet::Control(ControlCell::Create {
            circuit_id,
            public_value,
            relayed: true,
        });
        let reply = quic::request(conn, &request, self.config.handshake_timeout).await?;
        match reply {
            Packet::Control(ControlCell::Created {
                circuit_id: id,
                public_value,
                confirmation,
            }) if id == circuit_id => Ok((public_value, confirmation)),
            other => {
                let (kind, command) = other.kind();
                Err(CircuitError::ProtocolViolation(format!(
                    "answer to create for {circuit_id} was {kind}/{command}"
                )))
            }
        }
    }

    /// Connect to the next hop and serve whatever it sends back on that
    /// connection (inbound cells pushed toward the client).
    async fn connect_next_hop(&self, target: SocketAddr) -> Result<Connection> {
        let conn = self
            .quic
            .connect_within(target, self.config.handshake_timeout)
            .await?;
        tokio::spawn(self.clone().serve_connection(conn.clone()));
        Ok(conn)
    }
}
