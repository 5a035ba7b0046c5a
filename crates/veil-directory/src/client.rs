//! Requests against a directory server.
//!
//! Each request opens its own connection, performs one exchange and closes
//! it. Transient failures are retried up to `max_attempts` times; a wrong
//! kind of answer is not retried.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, warn};
use veil_transport::quic;
use veil_transport::{DirectoryMessage, Packet, QuicNode};
use veil_types::NodeRegistration;

use crate::{DirectoryError, Result, DEFAULT_IO_TIMEOUT_MS, DEFAULT_MAX_ATTEMPTS};

/// Client for a single directory server.
#[derive(Clone, Debug)]
pub struct DirectoryClient {
    directory: SocketAddr,
    timeout: Duration,
    max_attempts: u32,
}

impl DirectoryClient {
    /// Client with default timeout and attempt count.
    pub fn new(directory: SocketAddr) -> Self {
        Self {
            directory,
            timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Bound each attempt by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Make at most `attempts` attempts per request (at least one).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn directory_addr(&self) -> SocketAddr {
        self.directory
    }

    /// Fetch the current registry.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Network`] after `max_attempts` failed
    /// attempts, or [`DirectoryError::UnexpectedAnswer`] if the directory
    /// replied with something other than a registry.
    pub async fn query(&self, quic: &QuicNode) -> Result<Vec<NodeRegistration>> {
        let packet = Packet::Directory(DirectoryMessage::Query {
            context: String::new(),
        });
        self.exchange(quic, &packet).await
    }

    /// Register (or refresh) `registration` and return the resulting registry.
    ///
    /// # Errors
    ///
    /// Same as [`DirectoryClient::query`].
    pub async fn update(
        &self,
        quic: &QuicNode,
        registration: &NodeRegistration,
    ) -> Result<Vec<NodeRegistration>> {
        let packet = Packet::Directory(DirectoryMessage::update(registration));
        self.exchange(quic, &packet).await
    }

    async fn exchange(&self, quic: &QuicNode, packet: &Packet) -> Result<Vec<NodeRegistration>> {
        let mut last_error = String::from("no attempt made");
        for attempt in 1..=self.max_attempts {
            match self.attempt(quic, packet).await {
                Ok(Packet::Directory(DirectoryMessage::Answer { registry })) => {
                    debug!(
                        directory = %self.directory,
                        nodes = registry.len(),
                        "directory answered"
                    );
                    return Ok(registry);
                }
                Ok(other) => {
                    let (kind, command) = other.kind();
                    return Err(DirectoryError::UnexpectedAnswer(format!(
                        "{kind}/{command}"
                    )));
                }
                Err(e) => {
                    warn!(
                        directory = %self.directory,
                        attempt,
                        max_attempts = self.max_attempts,
                        "directory request failed: {e}"
                    );
                    last_error = e.to_string();
                }
            }
        }
        Err(DirectoryError::Network(format!(
            "{} after {} attempts: {last_error}",
            self.directory, self.max_attempts
        )))
    }

    async fn attempt(
        &self,
        quic: &QuicNode,
        packet: &Packet,
    ) -> std::result::Result<Packet, veil_transport::TransportError> {
        let conn = quic.connect_within(self.directory, self.timeout).await?;
        let reply = quic::request(&conn, packet, self.timeout).await;
        conn.close(0u32.into(), b"done");
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DirectoryConfig, DirectoryServer};
    use std::sync::Arc;
    use veil_transport::StopFlag;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn test_update_then_query() {
        let mut config = DirectoryConfig::new(loopback());
        config.io_timeout = Duration::from_millis(200);
        let server = Arc::new(DirectoryServer::bind(config).expect("bind"));
        let stop = StopFlag::new();
        let task = {
            let server = server.clone();
            let stop = stop.clone();
            tokio::spawn(async move { server.run(stop).await })
        };

        let quic = QuicNode::client(loopback()).expect("client endpoint");
        let client = DirectoryClient::new(server.local_addr()).with_timeout(Duration::from_secs(5));
        let reg = NodeRegistration::new("127.0.0.1", 9100, [9u8; 32]);

        let after_first = client.update(&quic, &reg).await.expect("update");
        let after_second = client.update(&quic, &reg).await.expect("update again");
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_second, after_first);

        let listed = client.query(&quic).await.expect("query");
        assert_eq!(listed, vec![reg]);

        stop.stop();
        task.await.expect("server task");
    }

    #[tokio::test]
    async fn test_unreachable_directory_exhausts_attempts() {
        // Bind and immediately drop a socket to get a port nobody serves.
        let port = std::net::UdpSocket::bind(loopback())
            .and_then(|s| s.local_addr())
            .expect("free port")
            .port();
        let quic = QuicNode::client(loopback()).expect("client endpoint");
        let client = DirectoryClient::new(SocketAddr::from(([127, 0, 0, 1], port)))
            .with_timeout(Duration::from_millis(100))
            .with_max_attempts(2);

        assert!(matches!(
            client.query(&quic).await,
            Err(DirectoryError::Network(_))
        ));
    }
}
