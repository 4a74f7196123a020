//! outpost server
//!
//! Accepts upstream agents, joins the cluster and proxies client requests
//! to whichever node holds the endpoint's upstream.

use std::sync::Arc;

use anyhow::{Context, Result};
use outpost_server::{AllowAll, CredentialVerifier, Server, ServerConfig, StaticTokens};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to OUTPOST_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting outpost server");
    info!(
        upstream_addr = %config.upstream_addr,
        proxy_addr = %config.proxy_addr,
        cluster_addr = %config.cluster_addr,
        seeds = ?config.seeds,
        "Configuration loaded"
    );

    let tokens = StaticTokens::from_csv(&std::env::var("OUTPOST_TOKENS").unwrap_or_default());
    let verifier: Arc<dyn CredentialVerifier> = if tokens.is_empty() {
        warn!("OUTPOST_TOKENS is empty, accepting every upstream credential");
        Arc::new(AllowAll)
    } else {
        Arc::new(tokens)
    };

    let mut server = Server::new(config, verifier).context("invalid configuration")?;
    server.start().await.context("failed to start server")?;

    if let Some(status) = server.status().await {
        info!(
            status = %serde_json::to_string(&status).unwrap_or_default(),
            "Node ready"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, relying on ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
