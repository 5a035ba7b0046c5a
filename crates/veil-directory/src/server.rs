//! Directory server over QUIC.
//!
//! Accepts connections, reads one request envelope per bidirectional stream,
//! and answers with the full registry. Updates are persisted before the
//! answer is written.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use quinn::{Connection, RecvStream, SendStream};
use tracing::{debug, info, warn};
use veil_transport::quic::{self, QuicConfig};
use veil_transport::{DirectoryMessage, Packet, QuicNode, StopFlag, TransportError};
use veil_types::NodeRegistration;

use crate::{DirectoryConfig, DirectoryError, Registry, Result};

/// Application error code used when a request is rejected.
const REJECT_CODE: u32 = 1;

/// Shared registry state handed to every stream task.
struct RegistryState {
    registry: Mutex<Registry>,
    path: Option<PathBuf>,
}

impl RegistryState {
    fn snapshot(&self) -> Vec<NodeRegistration> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries()
            .to_vec()
    }

    /// Upsert and persist under the same lock so the file always reflects
    /// the latest update. The in-memory registry only changes once the
    /// updated copy is on disk.
    fn register(&self, registration: NodeRegistration) -> Result<Vec<NodeRegistration>> {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let endpoint = format!("{}:{}", registration.address, registration.port);
        let mut updated = registry.clone();
        let added = updated.upsert(registration);
        if let Some(path) = &self.path {
            updated.save(path)?;
        }
        *registry = updated;
        if added {
            info!(node = %endpoint, "node registered");
        } else {
            debug!(node = %endpoint, "node registration refreshed");
        }
        Ok(registry.entries().to_vec())
    }
}

/// The directory server.
pub struct DirectoryServer {
    quic: QuicNode,
    state: Arc<RegistryState>,
    io_timeout: Duration,
}

impl DirectoryServer {
    /// Bind the listener and load any persisted registry.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Persistence`] if the persisted registry is
    /// unreadable, or a transport error if the endpoint cannot be bound.
    pub fn bind(config: DirectoryConfig) -> Result<Self> {
        let registry = match &config.registry_path {
            Some(path) => Registry::load(path)?,
            None => Registry::new(),
        };
        let quic = QuicNode::new(QuicConfig::bind(config.listen_addr))?;
        info!(
            addr = %quic.local_addr(),
            nodes = registry.len(),
            "directory listening"
        );
        Ok(Self {
            quic,
            state: Arc::new(RegistryState {
                registry: Mutex::new(registry),
                path: config.registry_path,
            }),
            io_timeout: config.io_timeout,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.quic.local_addr()
    }

    /// Current registry contents.
    pub fn registry(&self) -> Vec<NodeRegistration> {
        self.state.snapshot()
    }

    /// Run the accept loop until `stop` is set.
    pub async fn run(&self, stop: StopFlag) {
        while !stop.is_stopped() {
            let incoming = match tokio::time::timeout(self.io_timeout, self.quic.accept()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(incoming)) => incoming,
            };
            let state = self.state.clone();
            let stop = stop.clone();
            let io_timeout = self.io_timeout;
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => serve_connection(state, conn, stop, io_timeout).await,
                    Err(e) => warn!("directory handshake failed: {e}"),
                }
            });
        }
        self.quic.close(0, b"directory stopped");
        info!("directory stopped");
    }
}

async fn serve_connection(
    state: Arc<RegistryState>,
    conn: Connection,
    stop: StopFlag,
    io_timeout: Duration,
) {
    let peer = conn.remote_address();
    while !stop.is_stopped() {
        let (send, recv) = match tokio::time::timeout(io_timeout, QuicNode::accept_bi(&conn)).await
        {
            Err(_) => continue,
            Ok(Err(_)) => break,
            Ok(Ok(streams)) => streams,
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_stream(&state, send, recv, io_timeout).await {
                warn!(%peer, "directory request rejected: {e}");
            }
        });
    }
    debug!(%peer, "directory connection closed");
}

async fn serve_stream(
    state: &RegistryState,
    mut send: SendStream,
    mut recv: RecvStream,
    io_timeout: Duration,
) -> Result<()> {
    let outcome = match quic::within(io_timeout, QuicNode::recv_packet(&mut recv)).await {
        Ok(packet) => handle_packet(state, packet),
        Err(e) => Err(e.into()),
    };
    match outcome {
        Ok(reply) => {
            QuicNode::send_packet(&mut send, &reply).await?;
            send.finish()
                .map_err(|e| TransportError::Io(e.to_string()))?;
            Ok(())
        }
        Err(e) => {
            let code = quinn::VarInt::from_u32(REJECT_CODE);
            let _ = send.reset(code);
            let _ = recv.stop(code);
            Err(e)
        }
    }
}

/// Answer one request. Pure with respect to the network.
fn handle_packet(state: &RegistryState, packet: Packet) -> Result<Packet> {
    let registry = match packet {
        Packet::Directory(DirectoryMessage::Query { context }) => {
            debug!(%context, "directory query");
            state.snapshot()
        }
        Packet::Directory(DirectoryMessage::Update {
            address,
            port,
            public_key,
        }) => state.register(NodeRegistration::new(address, port, public_key))?,
        other => {
            let (kind, command) = other.kind();
            return Err(DirectoryError::Transport(TransportError::ProtocolViolation(
                format!("directory does not accept {kind}/{command}"),
            )));
        }
    };
    Ok(Packet::Directory(DirectoryMessage::Answer { registry }))
}
