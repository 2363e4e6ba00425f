//! Periodic forwarder: pending punches from the store to the HTTP backend.
//!
//! At-least-once by construction: a row leaves `pending` only after the
//! backend answered 2xx for it, and a row never uploads again after
//! `mark_synced`. Failed rows simply wait for the next cycle; there is no
//! per-row backoff, but the cycle sleep carries +-10% jitter so a fleet of
//! collectors does not stampede one backend.

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::entities::attendance;
use crate::error::{AppError, Result};
use crate::store::Store;

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Uploader {
    store: Store,
    http: reqwest::Client,
    batch_size: u64,
    shutdown: watch::Receiver<bool>,
}

impl Uploader {
    pub fn new(store: Store, batch_size: u64, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            store,
            http,
            batch_size,
            shutdown,
        })
    }

    /// Cycle until shutdown: upload a batch, sleep the configured interval.
    pub async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sync_cycle().await {
                error!("upload cycle failed: {e}");
            }

            let interval = self.next_interval().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        info!("uploader stopped");
    }

    /// Configured cycle length with jitter applied.
    async fn next_interval(&self) -> Duration {
        let secs = self
            .store
            .get_config("sync_interval", "")
            .await
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS);
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::from_secs_f64(secs as f64 * jitter)
    }

    /// One pass: POST each pending row, then retire the acknowledged ids in
    /// a single statement. Rows the backend refused stay pending.
    pub(crate) async fn sync_cycle(&self) -> Result<()> {
        let site_url = self.store.get_config("site_url", "").await?;
        if site_url.trim().is_empty() || site_url.contains("your Website URL") {
            warn!("site_url not configured; skipping upload cycle");
            return Ok(());
        }

        let rows = self.store.get_unsynced(self.batch_size).await?;
        if rows.is_empty() {
            return Ok(());
        }
        let endpoint = format!("{site_url}biometric");
        debug!("uploading {} punches to {endpoint}", rows.len());

        let mut acknowledged = Vec::with_capacity(rows.len());
        for row in &rows {
            if *self.shutdown.borrow() {
                break;
            }
            match self.post_row(&endpoint, row).await {
                Ok(()) => acknowledged.push(row.id),
                Err(e) => warn!(
                    "punch {} (user {}, device {}) not accepted: {e}",
                    row.id, row.user_id, row.device_sn
                ),
            }
        }

        if !acknowledged.is_empty() {
            let count = self.store.mark_synced(&acknowledged).await?;
            info!("synced {count} punches");
        }
        Ok(())
    }

    async fn post_row(&self, endpoint: &str, row: &attendance::Model) -> Result<()> {
        let body = serde_json::json!({
            "uid": row.user_id,
            "user_id": row.user_id,
            "t": row.punch_time.format("%Y-%m-%dT%H:%M:%S").to_string(),
            "ip": row.device_ip,
            "serial_number": row.device_sn,
        });

        let response = self.http.post(endpoint).json(&body).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::upload(format!("backend answered {}", response.status())))
        }
    }
}
