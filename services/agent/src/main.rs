//! outpost agent

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use outpost_agent::{AgentConfig, EndpointTarget};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "outpost-agent")]
#[command(about = "Expose local services through an outpost cluster")]
#[command(version)]
struct Cli {
    /// Server upstream address (host:port)
    #[arg(long, env = "OUTPOST_SERVER")]
    server: String,

    /// Credential presented at registration
    #[arg(long, env = "OUTPOST_CREDENTIAL", hide_env_values = true)]
    credential: String,

    /// Endpoint to serve, as name=host:port (repeatable)
    #[arg(long = "endpoint", required = true)]
    endpoints: Vec<EndpointTarget>,

    /// Agent name reported to the server
    #[arg(long, env = "OUTPOST_AGENT_NAME")]
    name: Option<String>,

    /// Maximum reconnect backoff in seconds
    #[arg(long, default_value_t = 30)]
    reconnect_max_secs: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "OUTPOST_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let mut config = AgentConfig::new(cli.server, cli.credential);
    config.endpoints = cli.endpoints;
    config.name = cli.name;
    config.reconnect_max = Duration::from_secs(cli.reconnect_max_secs.max(1));

    info!(
        server = %config.server_addr,
        endpoints = %config
            .endpoints
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(","),
        "Starting outpost agent"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    outpost_agent::run(config, shutdown_rx).await?;
    info!("Agent stopped");
    Ok(())
}
