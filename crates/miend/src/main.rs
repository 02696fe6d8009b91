use anyhow::Result;
use mien_hw::V4lCamera;
use mien_notify::{Fanout, FanoutConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus;
mod engine;
mod enroll;
mod scanner;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::load()?;
    tracing::info!(
        device = %config.camera_device,
        db = %config.db_path.display(),
        models = %config.model_cache_dir.display(),
        "miend starting"
    );

    let fetcher = mien_core::HttpFetcher::new()?;
    let cache = Arc::new(mien_core::ModelCache::new(
        fetcher,
        config.model_base_url.clone(),
        config.model_cache_dir.clone(),
    ));
    let engine = engine::spawn_engine(cache);

    let camera = Arc::new(V4lCamera::new(
        config.camera_device.clone(),
        config.frame_width,
        config.frame_height,
    ));
    let scanner = Arc::new(tokio::sync::Mutex::new(scanner::Scanner::new(
        engine.clone(),
        camera.clone(),
        config.scan_interval(),
    )));

    let store = store::FaceStore::open(&config.db_path, &config.key_path).await?;
    let fanout = Fanout::spawn(FanoutConfig {
        delivery_delay: config.notify_delivery(),
        drain_gap: config.notify_drain_gap(),
    });

    let service = dbus::KioskService::new(
        scanner.clone(),
        engine,
        camera,
        store,
        fanout,
        &config,
    );

    let _connection = zbus::connection::Builder::session()?
        .name("org.mien.Kiosk1")?
        .serve_at("/org/mien/Kiosk1", service)?
        .build()
        .await?;

    tracing::info!("miend ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("miend shutting down");

    // The camera must never stay open past shutdown.
    scanner.lock().await.stop();

    Ok(())
}
