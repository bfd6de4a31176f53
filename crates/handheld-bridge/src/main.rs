use anyhow::{Context, Result, bail};
use clap::Parser;
use handheld_bridge::{BridgeConfig, BridgeServer};
use handheld_core::constants::DEFAULT_BRIDGE_REQUEST_TIMEOUT_MS;
use handheld_transport::proxy::DEFAULT_DEVICE_CLASS;
use handheld_transport::{RadioConfig, SimulatorConfig, TransportConfig, TransportPreference};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Expose a handheld reader to proxy clients over TCP.
#[derive(Parser, Debug)]
#[command(name = "handheld-bridge")]
#[command(about = "Expose a handheld reader to proxy clients over TCP", long_about = None)]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, env = "HANDHELD_BRIDGE_ADDR", default_value = "127.0.0.1:7878")]
    bind: SocketAddr,

    /// Link to the reader (auto, radio, simulated)
    #[arg(short, long, env = "HANDHELD_BRIDGE_TRANSPORT", default_value = "simulated")]
    transport: TransportPreference,

    /// Device class clients must request
    #[arg(long, default_value = DEFAULT_DEVICE_CLASS)]
    device_class: String,

    /// Only connect to a radio reader advertising this name
    #[arg(long, value_name = "NAME")]
    device_name: Option<String>,

    /// Milliseconds a client may take to send its connect request
    #[arg(long, value_name = "MS", default_value_t = DEFAULT_BRIDGE_REQUEST_TIMEOUT_MS)]
    handshake_timeout_ms: u64,
}

impl Cli {
    fn into_config(self) -> Result<BridgeConfig> {
        if self.transport == TransportPreference::Proxy {
            bail!("the bridge cannot be backed by another bridge");
        }

        let mut radio = RadioConfig::default();
        if let Some(name) = self.device_name {
            radio = radio.with_device_name(name);
        }
        let transport = TransportConfig::default()
            .with_preference(self.transport)
            .with_radio(radio)
            .with_simulator(SimulatorConfig::default());

        Ok(BridgeConfig::new(self.bind, transport)
            .with_device_class(self.device_class)
            .with_handshake_timeout(Duration::from_millis(self.handshake_timeout_ms)))
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received"),
        Err(e) => {
            warn!(error = %e, "Cannot listen for interrupts, running until killed");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = cli.into_config()?;
    info!(
        transport = %config.transport.preference,
        device_class = %config.device_class,
        "Starting handheld bridge"
    );

    let server = BridgeServer::bind(config)
        .await
        .context("Failed to start bridge")?;
    info!(addr = %server.local_addr()?, "Bridge ready");

    server
        .run_until(shutdown_signal())
        .await
        .context("Bridge stopped with an error")?;
    info!("Bridge stopped");
    Ok(())
}
