//! Worker daemon entry point. Reads connection and tuning configuration
//! from the environment, builds a registry of the sample activities
//! below, and runs until `Ctrl+C`.
//!
//! Grounded in `crates/worker/src/main.rs`'s `tokio::select!` shutdown
//! shape; telemetry init follows `everruns_core::telemetry::init_telemetry`
//! but is inlined here rather than imported, since that crate is not part
//! of this workspace.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use durabletask::channel::GrpcChannel;
use durabletask::config::{ConnectionInfo, WorkerOptions};
use durabletask::registry::Registry;
use durabletask::worker::Worker;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("durabletask=info")))
        .init();

    let connection_string = std::env::var("DURABLETASK_CONNECTION_STRING")
        .context("DURABLETASK_CONNECTION_STRING must be set")?;
    let connection = ConnectionInfo::parse(&connection_string).context("failed to parse connection string")?;
    let worker_id = std::env::var("DURABLETASK_WORKER_ID")
        .unwrap_or_else(|_| uuid::Uuid::new_v7(uuid::Timestamp::now(uuid::NoContext)).to_string());

    tracing::info!(
        endpoint = %connection.endpoint,
        task_hub = %connection.task_hub,
        worker_id = %worker_id,
        "starting worker"
    );

    let options = WorkerOptions::default();
    let registry = Registry::builder().build().context("failed to build registry")?;
    let channel = Arc::new(GrpcChannel::new(connection.endpoint.clone(), connection.task_hub.clone()));
    let worker = Worker::new(channel, worker_id, connection.task_hub.clone(), registry, options);

    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "worker exited with an error");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            worker.shutdown(Duration::from_secs(30)).await;
        }
    }

    tracing::info!("worker shutdown complete");
    Ok(())
}
