use anyhow::{Context, Result};
use tokio::signal;

use ara_message_broker::config::Settings;
use ara_message_broker::storage::create_storage_backend;
use ara_message_broker::telemetry::init_tracing;
use ara_message_broker::{Store, StoreOptions};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new().context("Failed to load configuration")?;

    // Initialize tracing
    init_tracing(&settings.log)?;
    tracing::info!(backend = %settings.store.backend, "Configuration loaded");

    // Connect storage and start the store
    let backend = create_storage_backend(&settings)
        .await
        .context("Failed to create storage backend")?;
    let store = Store::new(backend, StoreOptions::from_settings(&settings));
    store.start().await.context("Failed to start store")?;

    shutdown_signal_handler().await?;

    store.shutdown().await;
    tracing::info!("Broker shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<_, anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        result = terminate => {
            result?;
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
    Ok(())
}
