//! K8up Kubernetes Operator
//!
//! Main entry point for the operator. Loads the configuration, sets up the
//! Kubernetes client, builds every controller and runs them until a shutdown
//! signal arrives.

use kube::Client;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use k8up_operator::{config::OperatorConfig, operator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    info!("Starting K8up operator");

    let config = OperatorConfig::from_env()?;
    info!(
        metrics_bind = %config.metrics_bind,
        resync_secs = config.resync_period.as_secs(),
        workers = config.concurrent_workers,
        retries = config.job_retries,
        "Loaded configuration"
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let runtime = operator::build(client, config).await?;
    if !runtime.unavailable_kinds().is_empty() {
        error!(kinds = ?runtime.unavailable_kinds(), "Running without some resource kinds");
    }

    // Handle graceful shutdown
    let stop = runtime.stop_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal, stopping operator");
        stop.cancel();
    });

    if let Err(e) = runtime.run().await {
        error!(error = %e, "Operator stopped with errors");
        return Err(e.into());
    }

    info!("K8up operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
