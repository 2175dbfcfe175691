use anyhow::{Context, Result};
use faceid_core::{EncodingStore, FacialAuthService};
use faceid_store::{BlobSealer, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{FaceIdService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceidd starting");

    let config = config::Config::load().context("loading configuration")?;

    let mut store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    if let Some(key_file) = &config.store_key_file {
        store = store.with_sealer(BlobSealer::from_key_file(key_file)?);
        tracing::info!(key_file = %key_file.display(), "encodings sealed at rest");
    }
    let sealed = store.is_sealed();
    let store: Arc<dyn EncodingStore> = Arc::new(store);

    let service = Arc::new(FacialAuthService::new(config.engine.clone(), store));
    // Warm the known-face cache; a corrupt store should surface at startup.
    let enrolled = service
        .enrolled_count()
        .context("loading enrolled encodings")?;
    tracing::info!(enrolled, strict_mode = config.engine.strict_mode, "enrollments loaded");

    let engine = engine::spawn_pool(
        service,
        config.worker_threads,
        Duration::from_secs(config.request_timeout_secs),
    )?;

    let iface = FaceIdService::new(engine, config.max_image_bytes, sealed);
    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the bus"))?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "faceidd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("faceidd shutting down");

    Ok(())
}
