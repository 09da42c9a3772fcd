//! template-hub
//!
//! Template registry server. HTTP, gRPC and their TLS variants share a single
//! listening port; connections are told apart by their first bytes.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use thub_server::{lifecycle::spawn_signal_watcher, Args, Server};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const METRICS_UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // tonic and tokio-rustls build configs from the process default provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting template-hub");

    let mut config = args.build().context("invalid configuration")?;

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;
    let upkeep = {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_UPKEEP_INTERVAL);
            loop {
                interval.tick().await;
                metrics.run_upkeep();
            }
        })
    };
    config.metrics = Some(metrics);

    info!(
        listen_addr = %config.listen_addr,
        tls = config.tls.is_some(),
        root_path = %config.root_path,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals = spawn_signal_watcher(shutdown_tx);

    let result = Server::new(config).run(shutdown_rx).await;
    signals.abort();
    upkeep.abort();

    if let Err(e) = &result {
        error!(error = %e, "Server failed");
    }
    result.context("server failed")
}
