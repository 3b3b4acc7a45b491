use anyhow::{anyhow, Context, Result};
use rollcall_core::{ChannelObserver, HttpVerificationClient, ScanLoop, ScanObserver};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{ScannerService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();

    let camera = engine::spawn_camera(
        &config.camera_device,
        config.frame_width,
        config.frame_height,
        config.warmup_frames,
    )
    .context("camera unavailable")?;

    let client = HttpVerificationClient::new(
        &config.api_url,
        config.credentials(),
        config.verify_timeout(),
    )?;
    tracing::info!(endpoint = client.endpoint(), "verification endpoint configured");

    let scan = ScanLoop::new(camera, client)
        .with_settle_delay(config.settle_delay())
        .with_activity_capacity(config.activity_capacity);
    let scan = Arc::new(Mutex::new(scan));

    let (observer, events) = ChannelObserver::channel();
    let observer: Arc<dyn ScanObserver> = Arc::new(observer);

    let service = ScannerService::new(Arc::clone(&scan), config.timing(), Arc::clone(&observer));
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;
    tracing::info!(name = BUS_NAME, system_bus = config.system_bus, "D-Bus interface registered");

    tokio::spawn(dbus_interface::publish_events(conn.clone(), events));

    if config.autostart {
        scan.lock()
            .map_err(|_| anyhow!("scan loop lock poisoned"))?
            .start(config.timing(), Arc::clone(&observer))?;
    }

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    scan.lock()
        .map_err(|_| anyhow!("scan loop lock poisoned"))?
        .stop();

    Ok(())
}
