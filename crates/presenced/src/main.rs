use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod dbus_interface;
mod engine;
mod helper;

use attendance::{AttendanceService, ServiceSettings};
use config::{BusKind, Config};
use engine::Engine;
use helper::HelperProvider;
use presence_core::EmbeddingProvider;
use presence_store::Store;

const BUS_NAME: &str = "org.freedesktop.Presence1";
const OBJECT_PATH: &str = "/org/freedesktop/Presence1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::load().context("failed to load configuration")?;

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "database ready");

    let provider = HelperProvider::from_command_line(&config.extractor_command)
        .context("embedding provider misconfigured")?;
    let provider_name = provider.name().to_string();
    let engine = Engine::open(Box::new(provider), config.face_gate())
        .context("failed to start extraction engine")?;

    let settings = ServiceSettings {
        threshold: config.threshold(),
        policy: config.window_policy(),
        extract_timeout: config.extract_timeout(),
        match_role: config.match_role,
    };
    tracing::info!(
        threshold = settings.threshold.tau(),
        grace_minutes = settings.policy.grace().num_minutes(),
        timeout_secs = settings.extract_timeout.as_secs(),
        "recognition settings"
    );

    let service = Arc::new(AttendanceService::new(store.clone(), engine.handle(), settings));
    let iface = dbus_interface::PresenceService::new(
        service,
        provider_name,
        config.db_path.display().to_string(),
    );

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "presenced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    drop(connection);
    engine.close().await;
    if let Err(err) = store.close().await {
        tracing::warn!(error = %err, "database did not close cleanly");
    }

    Ok(())
}
