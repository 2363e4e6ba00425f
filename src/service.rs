//! Service orchestration: wires the store, device supervisor, and uploader
//! together and runs them until a shutdown signal.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{AppConfig, DeviceConfig};
use crate::error::Result;
use crate::store::Store;
use crate::supervisor::Supervisor;
use crate::uploader::Uploader;

/// How long in-flight uploads may run after shutdown is signalled.
const UPLOADER_GRACE: Duration = Duration::from_secs(10);

/// The collector process: one per site.
pub struct CollectorService {
    config: AppConfig,
}

impl CollectorService {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Run until SIGINT/SIGTERM, then drain and stop everything within a
    /// bounded grace period.
    pub async fn run(self) -> Result<()> {
        let store = Store::open(&self.config.database.path).await?;
        info!("store ready at {}", self.config.database.path.display());

        let devices = resolve_devices(&store, &self.config).await?;
        if devices.is_empty() {
            warn!("no devices configured; only the uploader will run");
        } else {
            info!("supervising {} device(s)", devices.len());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor::start(
            devices,
            store.clone(),
            Duration::from_secs(self.config.sync.soft_timeout_secs),
            shutdown_rx.clone(),
        );
        let uploader = Uploader::new(store.clone(), self.config.sync.batch_size, shutdown_rx)?;
        let uploader_task = tokio::spawn(uploader.run());

        wait_for_shutdown().await;
        let _ = shutdown_tx.send(true);

        supervisor.shutdown().await;

        let abort = uploader_task.abort_handle();
        if tokio::time::timeout(UPLOADER_GRACE, uploader_task).await.is_err() {
            warn!("uploader missed the grace window, aborting in-flight work");
            abort.abort();
        }

        info!("collector stopped");
        Ok(())
    }
}

/// The store's device table is authoritative. Config entries are upserted
/// into it first, then every active row is supervised; rows with a config
/// entry keep the config's connection knobs (password, transport, timers),
/// rows registered out-of-band run with defaults.
async fn resolve_devices(store: &Store, config: &AppConfig) -> Result<Vec<DeviceConfig>> {
    for device in &config.devices {
        store
            .add_device(
                &device.ip,
                device.port,
                &device.serial_number,
                device.display_name.as_deref(),
            )
            .await?;
    }

    let stored = store.get_active_devices().await?;
    Ok(stored
        .into_iter()
        .map(|row| {
            config
                .devices
                .iter()
                .find(|d| d.serial_number == row.serial_number)
                .cloned()
                .unwrap_or_else(|| {
                    DeviceConfig::from_store(row.ip, row.port as u16, row.serial_number, row.name)
                })
        })
        .collect())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
                _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            }
        }
        Err(e) => {
            warn!("could not install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, shutting down");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received, shutting down");
}
