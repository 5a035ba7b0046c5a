//! # veil-directory
//!
//! Directory service for the Veil overlay: the registry of relay nodes
//! (address, port, long-term public key) that clients sample circuit paths
//! from.
//!
//! - [`registry`]: the in-memory registry, upserted by endpoint and persisted as JSON
//! - [`server`]: the QUIC listener answering `query` and `update`
//! - [`client`]: bounded-retry requests against a directory

pub mod client;
pub mod registry;
pub mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use veil_transport::TransportError;

pub use client::DirectoryClient;
pub use registry::Registry;
pub use server::DirectoryServer;

/// Default bounded wait for accepts and reads, in milliseconds.
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 1000;

/// Default number of attempts per directory request.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Directory server settings.
#[derive(Clone, Debug)]
pub struct DirectoryConfig {
    /// Address the QUIC listener binds to.
    pub listen_addr: SocketAddr,
    /// Where the registry is persisted; `None` keeps it in memory only.
    pub registry_path: Option<PathBuf>,
    /// Bound on every accept and read.
    pub io_timeout: Duration,
}

impl DirectoryConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            registry_path: None,
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
        }
    }
}

/// Error types for directory operations.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The directory could not be reached within the allowed attempts.
    #[error("directory unreachable: {0}")]
    Network(String),

    /// Reading or writing the persisted registry failed.
    #[error("registry persistence error: {0}")]
    Persistence(String),

    /// The directory answered with something other than a registry.
    #[error("unexpected directory answer: {0}")]
    UnexpectedAnswer(String),

    /// Transport-level failure while serving a request.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type alias for directory operations.
pub type Result<T> = std::result::Result<T, DirectoryError>;
