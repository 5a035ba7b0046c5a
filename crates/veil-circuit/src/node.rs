//! Relay node runtime.
//!
//! An [`OnionNode`] owns a long-term identity, a QUIC endpoint and the three
//! circuit tables. [`OnionNode::run`] accepts connections and hands each one
//! to the [`Switchboard`], and runs the idle sweeper that forgets circuits
//! nobody has used for `circuit_idle_timeout`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use veil_directory::DirectoryClient;
use veil_transport::quic::QuicConfig;
use veil_transport::{QuicNode, StopFlag};
use veil_types::NodeRegistration;

use crate::handshake::RelayIdentity;
use crate::relay::{EchoExit, ExitHandler, IntermediateRelay};
use crate::switchboard::Switchboard;
use crate::table::NodeTables;
use crate::{CircuitConfig, CircuitError, Result};

/// A relay in the overlay.
pub struct OnionNode {
    identity: Arc<RelayIdentity>,
    quic: Arc<QuicNode>,
    tables: Arc<NodeTables>,
    config: CircuitConfig,
    exit: Arc<dyn ExitHandler>,
    advertised: Option<SocketAddr>,
}

impl OnionNode {
    /// Bind a relay on `listen_addr` with the given identity.
    ///
    /// # Errors
    ///
    /// Returns a network error if the QUIC endpoint cannot be bound.
    pub fn bind(
        listen_addr: SocketAddr,
        identity: RelayIdentity,
        config: CircuitConfig,
    ) -> Result<Self> {
        let quic = QuicNode::new(QuicConfig::bind(listen_addr))?;
        info!(
            addr = %quic.local_addr(),
            key = %hex::encode(identity.public_key().as_bytes()),
            "relay bound"
        );
        Ok(Self {
            identity: Arc::new(identity),
            quic: Arc::new(quic),
            tables: Arc::new(NodeTables::new()),
            config,
            exit: Arc::new(EchoExit),
            advertised: None,
        })
    }

    /// Replace the exit application (echo by default).
    pub fn with_exit_handler(mut self, exit: Arc<dyn ExitHandler>) -> Self {
        self.exit = exit;
        self
    }

    /// Publish `addr` in the directory instead of the bound address, for a
    /// relay listening on a wildcard address or behind a port mapping.
    pub fn with_advertised_addr(mut self, addr: SocketAddr) -> Self {
        self.advertised = Some(addr);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.quic.local_addr()
    }

    /// Connections the endpoint still tracks, including ones being closed.
    pub fn open_connections(&self) -> usize {
        self.quic.endpoint().open_connections()
    }

    pub fn identity(&self) -> &RelayIdentity {
        &self.identity
    }

    pub fn tables(&self) -> &Arc<NodeTables> {
        &self.tables
    }

    /// The entry this node advertises in the directory.
    pub fn registration(&self) -> NodeRegistration {
        NodeRegistration::from_socket_addr(
            self.advertised_addr(),
            self.identity.public_key().to_bytes(),
        )
    }

    fn advertised_addr(&self) -> SocketAddr {
        self.advertised.unwrap_or_else(|| self.local_addr())
    }

    /// Register with the directory. Returns the registry after the update.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Config`] if the advertised address is
    /// unspecified, and [`CircuitError::Directory`] if the directory cannot
    /// be reached within its attempts.
    pub async fn register(&self, directory: &DirectoryClient) -> Result<Vec<NodeRegistration>> {
        let addr = self.advertised_addr();
        if addr.ip().is_unspecified() {
            return Err(CircuitError::Config(format!(
                "refusing to advertise {addr}; set an advertised address"
            )));
        }
        let registry = directory.update(&self.quic, &self.registration()).await?;
        info!(
            directory = %directory.directory_addr(),
            nodes = registry.len(),
            "registered with directory"
        );
        Ok(registry)
    }

    /// Serve until `stop` is set. Returns within one I/O timeout of that.
    pub async fn run(&self, stop: StopFlag) {
        // Forwarded cells include extends, which wait on the next hop's
        // handshake.
        let relay = IntermediateRelay::new(
            self.tables.clone(),
            self.exit.clone(),
            self.config.handshake_timeout,
        );
        let board = Switchboard::new(
            self.identity.clone(),
            self.quic.clone(),
            self.tables.clone(),
            relay,
            self.config.clone(),
            stop.clone(),
        );
        let sweeper = tokio::spawn(sweep_idle(
            self.tables.clone(),
            self.config.clone(),
            stop.clone(),
        ));

        while !stop.is_stopped() {
            let incoming =
                match tokio::time::timeout(self.config.io_timeout, self.quic.accept()).await {
                    Err(_) => continue,
                    Ok(None) => break,
                    Ok(Some(incoming)) => incoming,
                };
            let board = board.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        debug!(peer = %conn.remote_address(), "accepted connection");
                        board.serve_connection(conn).await;
                    }
                    Err(e) => warn!("incoming handshake failed: {e}"),
                }
            });
        }

        sweeper.abort();
        self.quic.close(0, b"relay stopped");
        info!(addr = %self.local_addr(), "relay stopped");
    }
}

/// Periodically forget idle circuits. Wakes every I/O timeout to observe
/// `stop`, sweeps every `sweep_interval`.
async fn sweep_idle(tables: Arc<NodeTables>, config: CircuitConfig, stop: StopFlag) {
    let mut last_sweep = Instant::now();
    while !stop.is_stopped() {
        tokio::time::sleep(config.io_timeout).await;
        if last_sweep.elapsed() < config.sweep_interval {
            continue;
        }
        last_sweep = Instant::now();
        let expired = tables.sweep(config.circuit_idle_timeout);
        if !expired.is_empty() {
            info!(count = expired.len(), "expired idle circuits");
            for id in expired {
                debug!(circuit = %id, "circuit expired");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HopSecret;
    use crate::table::HopLinkage;
    use std::time::Duration;
    use veil_types::CircuitId;

    fn fast_config() -> CircuitConfig {
        CircuitConfig {
            io_timeout: Duration::from_millis(20),
            circuit_idle_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(20),
            ..CircuitConfig::default()
        }
    }

    #[tokio::test]
    async fn test_sweeper_expires_idle_circuits() {
        let tables = Arc::new(NodeTables::new());
        tables.circuits.put(CircuitId(1), HopLinkage::default());
        tables.keys.put(CircuitId(1), HopSecret::from_seed([1u8; 32]));
        let stop = StopFlag::new();
        let task = tokio::spawn(sweep_idle(tables.clone(), fast_config(), stop.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(tables.circuits.is_empty());
        assert!(tables.keys.is_empty());

        stop.stop();
        task.await.expect("sweeper");
    }

    #[tokio::test]
    async fn test_run_returns_after_stop() {
        let node = OnionNode::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            RelayIdentity::generate(),
            fast_config(),
        )
        .expect("bind");
        let registration = node.registration();
        assert_eq!(registration.port, node.local_addr().port());
        assert_eq!(registration.public_key, node.identity().public_key().to_bytes());

        let stop = StopFlag::new();
        let node = Arc::new(node);
        let task = {
            let node = node.clone();
            let stop = stop.clone();
            tokio::spawn(async move { node.run(stop).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("run exits promptly")
            .expect("run task");
    }

    #[tokio::test]
    async fn test_wildcard_bind_needs_advertised_addr() {
        let wildcard = SocketAddr::from(([0, 0, 0, 0], 0));
        let directory = DirectoryClient::new(SocketAddr::from(([127, 0, 0, 1], 9)));
        let node = OnionNode::bind(wildcard, RelayIdentity::generate(), fast_config())
            .expect("bind");
        assert!(node.registration().socket_addr().expect("addr").ip().is_unspecified());
        assert!(matches!(
            node.register(&directory).await,
            Err(CircuitError::Config(_))
        ));

        let port = node.local_addr().port();
        let public = SocketAddr::from(([192, 0, 2, 10], port));
        let node = node.with_advertised_addr(public);
        let registration = node.registration();
        assert_eq!(registration.address, "192.0.2.10");
        assert_eq!(registration.port, port);
    }
}
