use anyhow::{Context, Result};
use rollcall_core::{AttendanceDesk, GalleryStore, OnnxExtractor, SqliteLedger};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        gallery = %config.gallery_path.display(),
        db = %config.db_path.display(),
        tolerance = config.tolerance,
        "configuration loaded"
    );

    let extractor = OnnxExtractor::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    let gallery = GalleryStore::open(config.gallery_path.clone());
    let ledger = SqliteLedger::open(&config.db_path)
        .with_context(|| format!("opening ledger {}", config.db_path.display()))?;
    let desk = AttendanceDesk::new(gallery, ledger, config.tolerance);

    let engine = engine::spawn_engine(extractor, desk, config.upload_dir.clone())?;
    let service = dbus_interface::AttendanceService::new(engine.clone(), config.report_limit);

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(
        bus = if config.system_bus { "system" } else { "session" },
        name = dbus_interface::BUS_NAME,
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    if let Err(err) = engine.shutdown().await {
        tracing::error!(error = %err, "engine shutdown failed");
    }

    Ok(())
}
