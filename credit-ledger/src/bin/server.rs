//! Credit ledger server binary
//!
//! Opens the RocksDB store, starts the ledger actor and logs committed
//! events until interrupted.

use anyhow::Context;
use credit_ledger::{spawn_ledger_actor, Config, Metrics, RocksStore};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("CREDIT_LEDGER_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => Config::from_env().context("loading configuration from environment")?,
    };

    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(service = %config.service_name, data_dir = ?config.data_dir, "Starting credit ledger");

    let store = RocksStore::open(&config.data_dir, &config.storage).context("opening credit store")?;
    let metrics = Metrics::new().context("registering metrics")?;
    let handle = spawn_ledger_actor(store, &config, metrics);

    let mut events = handle.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => tracing::info!(
                    request_id = %envelope.request_id,
                    sequence = envelope.sequence,
                    kind = envelope.event.kind(),
                    "Event committed"
                ),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down credit ledger");
    handle.shutdown().await?;
    logger.abort();
    Ok(())
}
