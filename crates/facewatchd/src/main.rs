use anyhow::{Context, Result};
use facewatch_core::{LoopTiming, RemoteRecognizer, SqliteStore};
use facewatch_media::Camera;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod session;

const BUS_NAME: &str = "org.facewatch.FaceWatch1";
const OBJECT_PATH: &str = "/org/facewatch/FaceWatch1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facewatchd starting");

    let config = config::Config::load()?;
    tracing::info!(
        camera = %config.camera_device,
        db = %config.db_path.display(),
        recognizer = %config.recognizer_url,
        "configuration loaded"
    );

    let roster_store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    let settings_store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;

    let recognizer = RemoteRecognizer::new(
        config.recognizer_url.clone(),
        config.api_key.clone(),
        config.request_timeout(),
    )?;

    let engine = engine::spawn_engine::<Camera>(engine::EngineSettings {
        camera_device: config.camera_device.clone(),
        recordings_dir: config.recordings_dir.clone(),
        recording_frame_interval: config.recording_frame_interval(),
        reply_timeout: engine::DEFAULT_REPLY_TIMEOUT,
    })?;

    let session = Arc::new(session::Session::new(
        Arc::new(recognizer),
        engine,
        roster_store,
        settings_store,
        LoopTiming {
            period: config.poll_interval(),
            request_timeout: config.request_timeout(),
        },
        config.batch_workers,
    ));

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, dbus_interface::FaceWatchService::new(Arc::clone(&session)))?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facewatchd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facewatchd shutting down");

    session.stop_analysis();
    match session.stop_camera().await {
        Ok(Some(path)) => tracing::info!(path = %path.display(), "recording saved at shutdown"),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "failed to release camera"),
    }

    Ok(())
}
