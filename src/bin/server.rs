//! # Ingestion Server
//!
//! Standalone binary. Capabilities come from `INGEST__MODE` or `INGEST__CAPABILITIES`.
//!
//! ```bash
//! # Everything in one process
//! cargo run --bin ingestion-server
//!
//! # Only analytics ingestion and the health endpoint
//! INGEST__MODE=ingestion cargo run --bin ingestion-server
//! ```

use anyhow::Context;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use ingestion_server::clients::StandaloneConnector;
use ingestion_server::config::ServerConfig;
use ingestion_server::lifecycle::{install_panic_hook, Orchestrator};
use ingestion_server::worker_pool::NoopTaskRunner;
use ingestion_server::{logging, metrics};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "❌ Ingestion server failed to start");
            eprintln!("ingestion-server: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let config = ServerConfig::load().context("Failed to load configuration")?;
    logging::init_tracing(&config);
    metrics::register_metrics();

    info!("🚀 Starting ingestion server...");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));
    info!("   Environment: {}", config.environment);

    let orchestrator = Orchestrator::new(
        config,
        Arc::new(StandaloneConnector::new()),
        Arc::new(NoopTaskRunner),
    )
    .context("Invalid capability set")?;
    info!("   Capabilities: {:?}", orchestrator.capabilities());

    // Panics no recovery point catches end up in the orchestrator's fault funnel
    install_panic_hook(orchestrator.fault_sender());

    let status = orchestrator.run().await;
    info!("👋 Ingestion server exited with code {}", status.code());
    Ok(ExitCode::from(status.code() as u8))
}
