//! veil: the Veil network daemon.
//!
//! One process runs one role: the directory service, a relay node, or a
//! one-shot client that builds a circuit and sends a message through it.
//! Ctrl-C sets a shared stop flag; servers observe it within one I/O timeout.

mod config;

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Context;
use tracing::{info, warn};
use veil_circuit::handshake::RelayIdentity;
use veil_circuit::{OnionClient, OnionNode};
use veil_directory::{DirectoryClient, DirectoryServer};
use veil_transport::StopFlag;

use crate::config::{DaemonConfig, Role};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config
    let config = DaemonConfig::load()?;

    // 2. Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("veil={}", config.logging.log_level).parse()?),
        )
        .init();

    info!(role = ?config.role, "Veil daemon starting");

    // 3. Wire Ctrl-C to the stop flag
    let stop = StopFlag::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
                stop.stop();
            }
        });
    }

    // 4. Run the configured role
    match config.role {
        Role::Directory => run_directory(&config, stop).await?,
        Role::Relay => run_relay(&config, stop).await?,
        Role::Client => run_client(&config).await?,
    }

    info!("Daemon stopped");
    Ok(())
}

async fn run_directory(config: &DaemonConfig, stop: StopFlag) -> anyhow::Result<()> {
    let server = DirectoryServer::bind(config.directory_config()?)
        .context("starting directory service")?;
    info!(addr = %server.local_addr(), "directory listening");
    server.run(stop).await;
    Ok(())
}

async fn run_relay(config: &DaemonConfig, stop: StopFlag) -> anyhow::Result<()> {
    let circuit = config.circuit_config();
    let listen = config.listen_addr()?;
    let advertised = config.advertise_addr()?;
    if listen.ip().is_unspecified() && advertised.is_none() {
        anyhow::bail!("listen_addr {listen} is a wildcard; set network.advertise_addr");
    }

    let identity = match config.identity_path() {
        Some(path) => RelayIdentity::load_or_generate(&path)
            .with_context(|| format!("loading identity from {}", path.display()))?,
        None => RelayIdentity::generate(),
    };
    let mut node = OnionNode::bind(listen, identity, circuit.clone()).context("starting relay")?;
    if let Some(addr) = advertised {
        node = node.with_advertised_addr(addr);
    }

    let directory = DirectoryClient::new(config.directory_addr()?)
        .with_timeout(circuit.io_timeout)
        .with_max_attempts(circuit.max_attempts);
    node.register(&directory)
        .await
        .context("registering with directory")?;

    node.run(stop).await;
    Ok(())
}

async fn run_client(config: &DaemonConfig) -> anyhow::Result<()> {
    let client = OnionClient::new(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        config.circuit_config(),
    )?;
    let circuit_id = client
        .connect(config.directory_addr()?, config.circuit.hops)
        .await
        .context("building circuit")?;
    info!(circuit = %circuit_id, hops = config.circuit.hops, "circuit ready");

    let message = config.client.message.as_bytes();
    match client.send(circuit_id, message).await? {
        Some(reply) => info!(
            circuit = %circuit_id,
            reply = %String::from_utf8_lossy(&reply),
            "exit answered"
        ),
        None => warn!(circuit = %circuit_id, "exit sent no answer"),
    }

    client.close_circuit(circuit_id);
    Ok(())
}
