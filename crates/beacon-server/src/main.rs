use anyhow::{Context, Result};
use beacon_relay::RelayServer;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod telemetry;

use config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init(telemetry::LogFormat::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("Beacon relay starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let server_config = ServerConfig::from_env().context("Failed to load server configuration")?;
    server_config.log_config();

    let server = RelayServer::new(server_config.relay).context("Invalid relay configuration")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal_token.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    server
        .run(shutdown)
        .await
        .context("Relay server failed")?;

    info!("Beacon relay stopped");
    Ok(())
}
