//! Configuration file management.
//!
//! The daemon reads `$VEIL_CONFIG`, or `veil.toml` in the working directory.
//! Every field has a default, so a missing file or a partial one is fine.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use veil_circuit::CircuitConfig;
use veil_directory::DirectoryConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "VEIL_CONFIG";

/// Config file used when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_FILE: &str = "veil.toml";

/// What this process runs as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Relay node: registers with the directory and forwards circuits.
    #[default]
    Relay,
    /// Directory service.
    Directory,
    /// One-shot client: builds a circuit and sends a message through it.
    Client,
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub role: Role,
    /// Addresses.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Circuit timing and retries.
    #[serde(default)]
    pub circuit: CircuitSettings,
    /// Directory persistence.
    #[serde(default)]
    pub directory: DirectorySettings,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Client role settings.
    #[serde(default)]
    pub client: ClientSettings,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Where a relay listens.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Where the directory listens (and where relays and clients find it).
    #[serde(default = "default_directory_addr")]
    pub directory_addr: String,
    /// Address published to the directory. Empty = the listen address,
    /// which must then name a concrete interface.
    #[serde(default)]
    pub advertise_addr: String,
    /// Hex file holding the relay's identity secret. Empty = a fresh
    /// identity on every start.
    #[serde(default)]
    pub identity_path: String,
}

/// Circuit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_circuit_idle_timeout_secs")]
    pub circuit_idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Path length used by the client role.
    #[serde(default = "default_hops")]
    pub hops: usize,
}

/// Directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySettings {
    /// Registry file. Empty = keep the registry in memory only.
    #[serde(default = "default_registry_path")]
    pub registry_path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace" | "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Client role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Payload sent through the circuit once it is built.
    #[serde(default = "default_client_message")]
    pub message: String,
}

// Default value functions

fn default_listen_addr() -> String {
    "127.0.0.1:9001".to_string()
}

fn default_directory_addr() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_io_timeout_ms() -> u64 {
    veil_circuit::DEFAULT_IO_TIMEOUT_MS
}

fn default_handshake_timeout_ms() -> u64 {
    veil_circuit::DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_max_attempts() -> u32 {
    veil_circuit::DEFAULT_MAX_ATTEMPTS
}

fn default_circuit_idle_timeout_secs() -> u64 {
    veil_circuit::DEFAULT_CIRCUIT_IDLE_TIMEOUT_SECS
}

fn default_sweep_interval_secs() -> u64 {
    veil_circuit::DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_hops() -> usize {
    veil_circuit::DEFAULT_CIRCUIT_HOPS
}

fn default_registry_path() -> String {
    "registry.json".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_client_message() -> String {
    "hello through veil".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            directory_addr: default_directory_addr(),
            advertise_addr: String::new(),
            identity_path: String::new(),
        }
    }
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            io_timeout_ms: default_io_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_attempts: default_max_attempts(),
            circuit_idle_timeout_secs: default_circuit_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            hops: default_hops(),
        }
    }
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            registry_path: default_registry_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            message: default_client_message(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from `$VEIL_CONFIG` or `./veil.toml`.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            Self::parse(&content).with_context(|| format!("parsing {}", config_path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn config_path() -> PathBuf {
        std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.network
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen_addr {:?}", self.network.listen_addr))
    }

    pub fn directory_addr(&self) -> anyhow::Result<SocketAddr> {
        self.network
            .directory_addr
            .parse()
            .with_context(|| format!("invalid directory_addr {:?}", self.network.directory_addr))
    }

    /// Address relays publish, if it differs from the listen address.
    pub fn advertise_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        if self.network.advertise_addr.is_empty() {
            return Ok(None);
        }
        let addr = self
            .network
            .advertise_addr
            .parse()
            .with_context(|| format!("invalid advertise_addr {:?}", self.network.advertise_addr))?;
        Ok(Some(addr))
    }

    pub fn identity_path(&self) -> Option<PathBuf> {
        (!self.network.identity_path.is_empty()).then(|| PathBuf::from(&self.network.identity_path))
    }

    /// Circuit engine settings.
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            io_timeout: Duration::from_millis(self.circuit.io_timeout_ms),
            handshake_timeout: Duration::from_millis(self.circuit.handshake_timeout_ms),
            max_attempts: self.circuit.max_attempts,
            circuit_idle_timeout: Duration::from_secs(self.circuit.circuit_idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.circuit.sweep_interval_secs),
        }
    }

    /// Directory server settings.
    pub fn directory_config(&self) -> anyhow::Result<DirectoryConfig> {
        let mut config = DirectoryConfig::new(self.directory_addr()?);
        config.io_timeout = Duration::from_millis(self.circuit.io_timeout_ms);
        if !self.directory.registry_path.is_empty() {
            config.registry_path = Some(PathBuf::from(&self.directory.registry_path));
        }
        Ok(config)
    }
}
