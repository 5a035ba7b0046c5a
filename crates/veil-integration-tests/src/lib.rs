//! Integration fixtures for the Veil workspace.
//!
//! Every scenario under `tests/` runs real QUIC endpoints on loopback: a
//! directory, some relays and a client. The helpers here start those pieces
//! with short timeouts so failures surface in well under a second.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p veil-integration-tests
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use veil_circuit::handshake::RelayIdentity;
use veil_circuit::{CircuitConfig, OnionClient, OnionNode, Result};
use veil_directory::{DirectoryClient, DirectoryConfig, DirectoryServer};
use veil_transport::StopFlag;
use veil_types::NodeRegistration;

/// An ephemeral port on the loopback interface.
pub fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Circuit settings scaled down for tests.
pub fn fast_config() -> CircuitConfig {
    CircuitConfig {
        io_timeout: Duration::from_millis(100),
        handshake_timeout: Duration::from_millis(400),
        max_attempts: 2,
        ..CircuitConfig::default()
    }
}

/// A running directory service.
pub struct TestDirectory {
    pub server: Arc<DirectoryServer>,
    pub stop: StopFlag,
    task: JoinHandle<()>,
}

impl TestDirectory {
    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// A client for this directory using the test timeouts.
    pub fn client(&self) -> DirectoryClient {
        let config = fast_config();
        DirectoryClient::new(self.addr())
            .with_timeout(config.handshake_timeout)
            .with_max_attempts(config.max_attempts)
    }

    /// Stop the service and wait for its accept loop to return.
    pub async fn shutdown(self) {
        self.stop.stop();
        let _ = self.task.await;
    }
}

/// Start a directory on loopback, optionally persisting to `registry_path`.
pub fn spawn_directory(registry_path: Option<PathBuf>) -> Result<TestDirectory> {
    let mut config = DirectoryConfig::new(loopback());
    config.io_timeout = fast_config().io_timeout;
    config.registry_path = registry_path;

    let server = Arc::new(DirectoryServer::bind(config)?);
    let stop = StopFlag::new();
    let task = {
        let server = server.clone();
        let stop = stop.clone();
        tokio::spawn(async move { server.run(stop).await })
    };
    Ok(TestDirectory { server, stop, task })
}

/// Start `count` relays, register each with `directory` and serve them
/// until `stop` is set.
pub async fn spawn_relays(
    count: usize,
    directory: &TestDirectory,
    stop: &StopFlag,
) -> Result<Vec<Arc<OnionNode>>> {
    spawn_relays_with(count, directory, stop, fast_config()).await
}

/// [`spawn_relays`] with explicit circuit settings.
pub async fn spawn_relays_with(
    count: usize,
    directory: &TestDirectory,
    stop: &StopFlag,
    config: CircuitConfig,
) -> Result<Vec<Arc<OnionNode>>> {
    let client = directory.client();
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let node = Arc::new(OnionNode::bind(
            loopback(),
            RelayIdentity::generate(),
            config.clone(),
        )?);
        node.register(&client).await?;
        let running = node.clone();
        let stop = stop.clone();
        tokio::spawn(async move { running.run(stop).await });
        nodes.push(node);
    }
    Ok(nodes)
}

/// A client with its own endpoint and the test timeouts.
pub fn spawn_client() -> Result<OnionClient> {
    OnionClient::new(loopback(), fast_config())
}

/// A UDP socket that never answers, registered as if it were a relay.
///
/// Connecting to it never completes a QUIC handshake, so any hop pointing
/// at it times out. Keep the socket alive for as long as the test needs the
/// port reserved.
pub async fn silent_relay() -> std::io::Result<(UdpSocket, NodeRegistration)> {
    let socket = UdpSocket::bind(loopback()).await?;
    let identity = RelayIdentity::generate();
    let registration =
        NodeRegistration::from_socket_addr(socket.local_addr()?, identity.public_key().to_bytes());
    Ok((socket, registration))
}

/// Poll `condition` until it holds or `limit` passes. Returns whether it
/// held. Relays tear circuits down asynchronously, so tests wait for it.
pub async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Whether `node` holds no circuit state at all.
pub fn forgot_everything(node: &OnionNode) -> bool {
    let tables = node.tables();
    tables.circuits.is_empty() && tables.keys.is_empty() && tables.relays.is_empty()
}

/// Find the running node behind a registration.
pub fn node_for<'a>(
    nodes: &'a [Arc<OnionNode>],
    registration: &NodeRegistration,
) -> Option<&'a Arc<OnionNode>> {
    nodes
        .iter()
        .find(|node| node.local_addr().port() == registration.port)
}
