//! Per-device connection supervision and the capture-to-store pipeline.
//!
//! One worker task per configured device runs the live-capture loop and
//! pushes punches into a bounded queue; a drain task moves them into the
//! store, where the dedup index decides what is new. Workers reconnect on
//! any fault with doubling backoff, reset once a session delivers events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DeviceConfig;
use crate::store::{NewAttendance, Store};
use crate::zk::{Attendance, CaptureGuard, LiveEvent, ZkClient, ZkError};

/// Slots in the in-memory ingestion queue.
const QUEUE_DEPTH: usize = 1024;

const BACKOFF_START: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// How long `shutdown` waits for workers before force-aborting them.
const JOIN_DEADLINE: Duration = Duration::from_secs(5);

/// Attempts to store one event before it is dropped (the queue has already
/// given it up; loss here only happens while storage itself is failing).
const STORE_RETRIES: u32 = 3;

/// Point-in-time view of one supervised device.
#[derive(Debug, Clone, Default)]
pub struct DeviceStatus {
    pub connected: bool,
    /// Device clock as read right after the last handshake.
    pub device_time: Option<NaiveDateTime>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

type StatusMap = Arc<Mutex<HashMap<String, DeviceStatus>>>;
type GuardMap = Arc<Mutex<HashMap<String, CaptureGuard>>>;

/// Owns the device workers and the queue drain task.
pub struct Supervisor {
    statuses: StatusMap,
    guards: GuardMap,
    workers: Vec<JoinHandle<()>>,
    drain: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawn one worker per device plus the drain task.
    pub fn start(
        devices: Vec<DeviceConfig>,
        store: Store,
        soft_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let statuses: StatusMap = Arc::new(Mutex::new(
            devices
                .iter()
                .map(|d| (d.serial_number.clone(), DeviceStatus::default()))
                .collect(),
        ));
        let guards: GuardMap = Arc::new(Mutex::new(HashMap::new()));

        let (tx, rx) = mpsc::channel::<NewAttendance>(QUEUE_DEPTH);
        let drain = tokio::spawn(drain_worker(store.clone(), rx));

        let workers = devices
            .into_iter()
            .map(|device| {
                tokio::spawn(device_worker(
                    device,
                    soft_timeout,
                    store.clone(),
                    tx.clone(),
                    Arc::clone(&statuses),
                    Arc::clone(&guards),
                    shutdown.clone(),
                ))
            })
            .collect();
        // the drain task ends once every worker has dropped its sender

        Self {
            statuses,
            guards,
            workers,
            drain: Some(drain),
        }
    }

    /// Snapshot of one device's state.
    pub fn get_device_status(&self, serial_number: &str) -> Option<DeviceStatus> {
        lock(&self.statuses).get(serial_number).cloned()
    }

    /// End every live capture, then join the workers and drain task within
    /// a bounded deadline; stragglers are aborted.
    pub async fn shutdown(mut self) {
        for guard in lock(&self.guards).values() {
            guard.cancel();
        }

        let deadline = tokio::time::Instant::now() + JOIN_DEADLINE;
        for worker in self.workers.drain(..) {
            let abort = worker.abort_handle();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, worker).await.is_err() {
                warn!("device worker missed the shutdown deadline, aborting");
                abort.abort();
            }
        }

        if let Some(drain) = self.drain.take() {
            let abort = drain.abort_handle();
            if tokio::time::timeout(JOIN_DEADLINE, drain).await.is_err() {
                warn!("queue drain missed the shutdown deadline, aborting");
                abort.abort();
            }
        }
        info!("all device workers stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

fn to_row(att: Attendance, device: &DeviceConfig) -> NewAttendance {
    NewAttendance {
        user_id: att.user_id,
        punch_time: att.timestamp,
        device_ip: device.ip.clone(),
        device_sn: device.serial_number.clone(),
        verify_type: att.status as i32,
        punch: att.punch as i32,
        device_uid: Some(att.uid as i32),
    }
}

/// Connect-capture-reconnect loop for one device.
async fn device_worker(
    device: DeviceConfig,
    soft_timeout: Duration,
    store: Store,
    tx: mpsc::Sender<NewAttendance>,
    statuses: StatusMap,
    guards: GuardMap,
    shutdown: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_START;
    let mut shutdown = shutdown;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let (events, outcome) =
            run_session(&device, soft_timeout, &store, &tx, &statuses, &guards, &shutdown).await;

        if events > 0 {
            backoff = BACKOFF_START;
        }
        {
            let mut map = lock(&statuses);
            let status = map.entry(device.serial_number.clone()).or_default();
            status.connected = false;
            match &outcome {
                Ok(()) => status.consecutive_failures = 0,
                Err(_) => status.consecutive_failures += 1,
            }
        }
        if let Err(e) = outcome {
            warn!(
                "device {}: session failed ({e}), reconnecting in {backoff:?}",
                device.label()
            );
        }

        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {}
        }
        backoff = next_backoff(backoff);
    }
    debug!("device {} worker exiting", device.label());
}

/// One connected session: handshake, housekeeping, live capture until
/// cancellation, fault, or shutdown. Returns how many events the session
/// delivered alongside its outcome.
async fn run_session(
    device: &DeviceConfig,
    soft_timeout: Duration,
    store: &Store,
    tx: &mpsc::Sender<NewAttendance>,
    statuses: &StatusMap,
    guards: &GuardMap,
    shutdown: &watch::Receiver<bool>,
) -> (u64, Result<(), ZkError>) {
    let mut client = ZkClient::new(device.zk_options());
    if let Err(e) = client.connect().await {
        return (0, Err(e));
    }
    lock(guards).insert(device.serial_number.clone(), client.capture_guard());

    if device.sync_time_on_connect {
        let now = Local::now().naive_local();
        match client.set_time(&now).await {
            Ok(()) => info!("device {}: clock synchronized", device.label()),
            Err(e) => warn!("device {}: clock sync failed: {e}", device.label()),
        }
    }

    let device_time = client.get_time().await.ok();
    {
        let mut map = lock(statuses);
        let status = map.entry(device.serial_number.clone()).or_default();
        status.connected = true;
        status.device_time = device_time;
    }
    if let Err(e) = store.touch_device(&device.serial_number).await {
        warn!("device {}: could not stamp last_sync: {e}", device.label());
    }

    if device.cache_users {
        match client.get_users().await {
            Ok(users) => {
                let count = users.len();
                for user in &users {
                    if let Err(e) = store.upsert_user(user).await {
                        warn!("device {}: user cache write failed: {e}", device.label());
                        break;
                    }
                }
                debug!("device {}: cached {count} users", device.label());
            }
            Err(e) => warn!("device {}: user table read failed: {e}", device.label()),
        }
    }

    if let Err(e) = client.live_capture_begin().await {
        client.disconnect().await;
        return (0, Err(e));
    }
    let guard = client.capture_guard();

    let mut events: u64 = 0;
    let outcome = loop {
        if guard.is_cancelled() || *shutdown.borrow() {
            break Ok(());
        }
        match client.live_capture_next(soft_timeout).await {
            Ok(LiveEvent::Punch(att)) => {
                debug!(
                    "device {}: punch user={} at {}",
                    device.label(),
                    att.user_id,
                    att.timestamp
                );
                events += 1;
                lock(statuses)
                    .entry(device.serial_number.clone())
                    .or_default()
                    .last_event_at = Some(Utc::now());
                if tx.send(to_row(att, device)).await.is_err() {
                    // drain is gone; the process is coming down
                    break Ok(());
                }
            }
            Ok(LiveEvent::Tick) => {}
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = client.live_capture_end().await {
        debug!("device {}: capture teardown incomplete: {e}", device.label());
    }
    client.disconnect().await;
    (events, outcome)
}

/// Move queued punches into the store. Duplicates are counted and
/// discarded; storage faults retry a few times before the event is dropped
/// with a loss counter.
async fn drain_worker(store: Store, mut rx: mpsc::Receiver<NewAttendance>) {
    let mut inserted: u64 = 0;
    let mut duplicates: u64 = 0;
    let mut dropped: u64 = 0;

    while let Some(row) = rx.recv().await {
        let mut attempt = 0;
        loop {
            match store.insert_attendance(&row).await {
                Ok(true) => {
                    inserted += 1;
                    debug!(
                        "stored punch user={} device={} ({} so far)",
                        row.user_id, row.device_sn, inserted
                    );
                    break;
                }
                Ok(false) => {
                    duplicates += 1;
                    break;
                }
                Err(e) if attempt < STORE_RETRIES => {
                    attempt += 1;
                    warn!("event store failed (attempt {attempt}/{STORE_RETRIES}): {e}");
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => {
                    dropped += 1;
                    error!(
                        "dropping punch user={} device={} after {STORE_RETRIES} attempts: {e}",
                        row.user_id, row.device_sn
                    );
                    break;
                }
            }
        }
    }

    info!("ingestion queue drained: {inserted} stored, {duplicates} duplicates, {dropped} lost");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn row(user_id: &str) -> NewAttendance {
        NewAttendance {
            user_id: user_id.to_string(),
            punch_time: NaiveDate::from_ymd_opt(2025, 6, 2)
                .unwrap()
                .and_hms_opt(9, 30, 0)
                .unwrap(),
            device_ip: "192.168.1.201".to_string(),
            device_sn: "CKJ9203388".to_string(),
            verify_type: 1,
            punch: 0,
            device_uid: None,
        }
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = BACKOFF_START;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen, [5, 10, 20, 40, 60]);
        assert_eq!(next_backoff(backoff).as_secs(), 60);
    }

    #[tokio::test]
    async fn drain_discards_duplicates() {
        let store = Store::open_in_memory().await.unwrap();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let drain = tokio::spawn(drain_worker(store.clone(), rx));

        tx.send(row("7")).await.unwrap();
        tx.send(row("7")).await.unwrap();
        tx.send(row("8")).await.unwrap();
        drop(tx);
        drain.await.unwrap();

        let pending = store.get_unsynced(100).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn queue_preserves_device_order() {
        let store = Store::open_in_memory().await.unwrap();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let drain = tokio::spawn(drain_worker(store.clone(), rx));

        for minute in [1u32, 2, 3] {
            let mut r = row(&format!("user-{minute}"));
            r.punch_time = NaiveDate::from_ymd_opt(2025, 6, 2)
                .unwrap()
                .and_hms_opt(9, minute, 0)
                .unwrap();
            tx.send(r).await.unwrap();
        }
        drop(tx);
        drain.await.unwrap();

        let pending = store.get_unsynced(100).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, ["user-1", "user-2", "user-3"]);
    }
}
