//! # courier-init
//!
//! Prepares a backing store for the Courier hub: creates the tables and
//! their indexes, enables message expiry and installs the self-talk service
//! account. Safe to run repeatedly; set `COURIER_RESET_DB=true` to start
//! from empty tables.

mod config;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_store::{Backend, MemoryBackend, Store};

use crate::config::{BackendKind, InitConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_store=debug")),
        )
        .init();

    info!("Starting courier-init v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let init = InitConfig::from_env();
    let store_config = init
        .load_store_config()
        .context("failed to load store configuration")?;
    info!(?init, "Loaded configuration");
    info!(
        config = %serde_json::to_string(&store_config)?,
        "Store configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Connect and bootstrap
    // -----------------------------------------------------------------------
    let backend = connect(init.backend, &store_config).await?;
    let store = Store::open(backend, &store_config)?;
    store
        .create_db(init.reset)
        .await
        .context("schema bootstrap failed")?;

    info!(reset = init.reset, "Database ready");
    Ok(())
}

#[cfg(feature = "dynamodb")]
async fn connect(
    kind: BackendKind,
    config: &courier_store::StoreConfig,
) -> anyhow::Result<Arc<dyn Backend>> {
    Ok(match kind {
        BackendKind::DynamoDb => Arc::new(courier_store::DynamoBackend::connect(config).await?),
        BackendKind::Memory => memory(),
    })
}

#[cfg(not(feature = "dynamodb"))]
async fn connect(
    kind: BackendKind,
    _config: &courier_store::StoreConfig,
) -> anyhow::Result<Arc<dyn Backend>> {
    if kind == BackendKind::DynamoDb {
        anyhow::bail!("built without the `dynamodb` feature");
    }
    Ok(memory())
}

fn memory() -> Arc<dyn Backend> {
    tracing::warn!("Using the in-memory backend; nothing will be persisted");
    Arc::new(MemoryBackend::new())
}
