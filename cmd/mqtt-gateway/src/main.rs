//! MQTT gateway - bridges MQTT 3.1.1 clients to an AMQP messaging backend.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mqttbridge::backend::memory::MemoryBroker;
use mqttbridge::{Gateway, GatewayConfig};

/// MQTT gateway.
///
/// Settings are read from the config file first, then from the
/// `MQTT_GATEWAY_*` and `MESSAGING_SERVICE_*` environment variables, then
/// from the flags below.
#[derive(Parser)]
#[command(name = "mqtt-gateway")]
#[command(about = "MQTT gateway bridging clients to an AMQP messaging backend")]
#[command(version)]
struct Cli {
    /// YAML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address the MQTT listener binds to
    #[arg(long)]
    bind_address: Option<String>,

    /// MQTT listener port
    #[arg(short = 'p', long)]
    listen_port: Option<u16>,

    /// Maximum MQTT packet size in bytes
    #[arg(long)]
    max_message_size: Option<usize>,

    /// Messaging backend host (not used by the embedded backend)
    #[arg(long)]
    messaging_service_host: Option<String>,

    /// Messaging backend port (not used by the embedded backend)
    #[arg(long)]
    messaging_service_port: Option<u16>,

    /// Session establishment deadline in seconds
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Serve MQTT over TLS
    #[arg(long)]
    ssl: bool,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert_file: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<GatewayConfig> {
        let base = match &self.config {
            Some(path) => GatewayConfig::from_yaml_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => GatewayConfig::default(),
        };
        let mut config = base.with_overrides(|key| std::env::var(key).ok())?;

        if let Some(v) = &self.bind_address {
            config.bind_address = v.clone();
        }
        if let Some(v) = self.listen_port {
            config.listen_port = v;
        }
        if let Some(v) = self.max_message_size {
            config.max_message_size = v;
        }
        if let Some(v) = &self.messaging_service_host {
            config.messaging_service_host = v.clone();
        }
        if let Some(v) = self.messaging_service_port {
            config.messaging_service_port = v;
        }
        if let Some(v) = self.handshake_timeout {
            config.handshake_timeout_secs = v;
        }
        if self.ssl {
            config.ssl = true;
        }
        if let Some(v) = &self.cert_file {
            config.cert_file = v.clone();
        }
        if let Some(v) = &self.key_file {
            config.key_file = v.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = cli.load_config()?;
    info!(
        "Starting MQTT gateway on {}, messaging service {}",
        config.listen_addr(),
        config.messaging_addr()
    );
    warn!("No AMQP client configured, serving from the embedded in-process broker");

    let gateway = Arc::new(Gateway::new(config, Arc::new(MemoryBroker::default())));

    let stopper = Arc::clone(&gateway);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            stopper.shutdown();
        }
    });

    gateway.serve().await.context("gateway failed")?;
    info!("MQTT gateway stopped");
    Ok(())
}
