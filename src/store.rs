//! Embedded SQLite store for devices, captured punches, and operator
//! settings.
//!
//! The dedup invariant lives here: a unique index over
//! `(user_id, punch_time, device_sn)` makes duplicate inserts no-ops, so a
//! punch delivered twice (device retransmit, reconnect replay) stores once.
//! Writers race only through that index or through plain UPDATEs; "database
//! is locked" errors retry with exponential backoff.

use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, SqlxSqliteConnector,
};
use tracing::{debug, warn};

use crate::entities::{attendance, configuration, devices, users};
use crate::error::Result;
use crate::zk::User;

/// Sync state of a stored punch.
pub const SYNC_PENDING: &str = "pending";
pub const SYNC_SYNCED: &str = "synced";

/// Batch size for bulk inserts (7 bound params per row keeps us far from
/// SQLite's 32k variable limit).
const INSERT_BATCH_SIZE: usize = 500;

const LOCK_RETRY_BASE: Duration = Duration::from_millis(50);
const LOCK_RETRY_MAX: u32 = 5;

const TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS devices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ip TEXT NOT NULL,
        port INTEGER NOT NULL DEFAULT 4370,
        serial_number TEXT NOT NULL UNIQUE,
        name TEXT,
        last_sync TIMESTAMP,
        is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1))
    )",
    "CREATE TABLE IF NOT EXISTS attendance (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        punch_time TIMESTAMP NOT NULL,
        device_ip TEXT NOT NULL,
        device_sn TEXT NOT NULL,
        verify_type INTEGER NOT NULL DEFAULT 0,
        punch INTEGER NOT NULL DEFAULT 0,
        device_uid INTEGER,
        status TEXT NOT NULL DEFAULT 'pending',
        sync_time TIMESTAMP,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS configuration (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS users (
        user_id TEXT PRIMARY KEY,
        name TEXT,
        privilege INTEGER,
        password TEXT,
        last_updated TIMESTAMP
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_attendance_user_time_device
        ON attendance(user_id, punch_time, device_sn)",
    "CREATE INDEX IF NOT EXISTS idx_attendance_status ON attendance(status)",
    "CREATE INDEX IF NOT EXISTS idx_attendance_punchtime ON attendance(punch_time)",
    "CREATE INDEX IF NOT EXISTS idx_devices_active ON devices(is_active)",
];

const CONFIG_DEFAULTS: &[(&str, &str)] = &[
    // empty site_url means "not configured yet"; the uploader idles
    ("site_url", ""),
    ("sync_interval", "300"),
    ("auto_start", "1"),
    ("log_level", "INFO"),
];

/// A punch ready to be persisted, with its device provenance.
#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub user_id: String,
    pub punch_time: NaiveDateTime,
    pub device_ip: String,
    pub device_sn: String,
    pub verify_type: i32,
    pub punch: i32,
    pub device_uid: Option<i32>,
}

impl NewAttendance {
    fn active_model(&self) -> attendance::ActiveModel {
        attendance::ActiveModel {
            user_id: Set(self.user_id.clone()),
            punch_time: Set(self.punch_time),
            device_ip: Set(self.device_ip.clone()),
            device_sn: Set(self.device_sn.clone()),
            verify_type: Set(self.verify_type),
            punch: Set(self.punch),
            device_uid: Set(self.device_uid),
            status: Set(SYNC_PENDING.to_string()),
            sync_time: Set(None),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
    }
}

/// Handle to the embedded database. Cloning shares the pool; every worker
/// operation checks its own connection out of it.
#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
}

impl Store {
    /// Open (or create) the store at `path` and apply schema and defaults.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        Self::connect(SqlitePoolOptions::new().max_connections(5), options).await
    }

    /// Open a private in-memory store (tests). A single pooled connection
    /// keeps every operation on the same database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DbErr::Conn(sea_orm::RuntimeErr::SqlxError(e)))?
            .foreign_keys(true);
        Self::connect(SqlitePoolOptions::new().max_connections(1), options).await
    }

    async fn connect(pool_options: SqlitePoolOptions, options: SqliteConnectOptions) -> Result<Self> {
        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| DbErr::Conn(sea_orm::RuntimeErr::SqlxError(e)))?;
        let store = Self {
            db: SqlxSqliteConnector::from_sqlx_sqlite_pool(pool),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        use sea_orm::ConnectionTrait;

        for ddl in TABLES {
            self.db.execute_unprepared(ddl).await?;
        }

        for (key, value) in CONFIG_DEFAULTS {
            let model = configuration::ActiveModel {
                key: Set((*key).to_string()),
                value: Set((*value).to_string()),
            };
            configuration::Entity::insert(model)
                .on_conflict(
                    OnConflict::column(configuration::Column::Key)
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&self.db)
                .await?;
        }
        Ok(())
    }

    /// Insert one punch; returns false when the dedup index swallowed it.
    pub async fn insert_attendance(&self, row: &NewAttendance) -> std::result::Result<bool, DbErr> {
        let db = &self.db;
        let inserted = with_lock_retry(|| {
            let model = row.active_model();
            async move {
                attendance::Entity::insert(model)
                    .on_conflict(dedup_conflict())
                    .exec_without_returning(db)
                    .await
            }
        })
        .await?;
        Ok(inserted > 0)
    }

    /// Batched dedup insert; returns how many rows were actually added.
    pub async fn bulk_insert_attendance(&self, rows: &[NewAttendance]) -> std::result::Result<u64, DbErr> {
        if rows.is_empty() {
            return Ok(0);
        }
        let db = &self.db;
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_BATCH_SIZE) {
            inserted += with_lock_retry(|| {
                let models: Vec<_> = chunk.iter().map(NewAttendance::active_model).collect();
                async move {
                    attendance::Entity::insert_many(models)
                        .on_conflict(dedup_conflict())
                        .exec_without_returning(db)
                        .await
                }
            })
            .await?;
        }
        Ok(inserted)
    }

    /// Pending punches in punch-time order, oldest first.
    pub async fn get_unsynced(&self, limit: u64) -> std::result::Result<Vec<attendance::Model>, DbErr> {
        let db = &self.db;
        with_lock_retry(|| async move {
            attendance::Entity::find()
                .filter(attendance::Column::Status.eq(SYNC_PENDING))
                .order_by_asc(attendance::Column::PunchTime)
                .limit(limit)
                .all(db)
                .await
        })
        .await
    }

    /// Retire uploaded rows in a single statement.
    pub async fn mark_synced(&self, ids: &[i64]) -> std::result::Result<u64, DbErr> {
        if ids.is_empty() {
            return Ok(0);
        }
        let db = &self.db;
        let now = Utc::now();
        let result = with_lock_retry(|| {
            let ids = ids.to_vec();
            async move {
                attendance::Entity::update_many()
                    .col_expr(attendance::Column::Status, Expr::value(SYNC_SYNCED))
                    .col_expr(attendance::Column::SyncTime, Expr::value(now))
                    .filter(attendance::Column::Id.is_in(ids))
                    .exec(db)
                    .await
            }
        })
        .await?;
        Ok(result.rows_affected)
    }

    pub async fn get_config(&self, key: &str, default: &str) -> std::result::Result<String, DbErr> {
        let db = &self.db;
        let row = with_lock_retry(|| {
            let key = key.to_string();
            async move { configuration::Entity::find_by_id(key).one(db).await }
        })
        .await?;
        Ok(row.map(|r| r.value).unwrap_or_else(|| default.to_string()))
    }

    pub async fn set_config(&self, key: &str, value: &str) -> std::result::Result<(), DbErr> {
        let db = &self.db;
        with_lock_retry(|| {
            let model = configuration::ActiveModel {
                key: Set(key.to_string()),
                value: Set(value.to_string()),
            };
            async move {
                configuration::Entity::insert(model)
                    .on_conflict(
                        OnConflict::column(configuration::Column::Key)
                            .update_column(configuration::Column::Value)
                            .to_owned(),
                    )
                    .exec_without_returning(db)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    /// Upsert a device row keyed by serial number.
    pub async fn add_device(
        &self,
        ip: &str,
        port: u16,
        serial_number: &str,
        name: Option<&str>,
    ) -> std::result::Result<(), DbErr> {
        let db = &self.db;
        with_lock_retry(|| {
            let model = devices::ActiveModel {
                ip: Set(ip.to_string()),
                port: Set(port as i32),
                serial_number: Set(serial_number.to_string()),
                name: Set(name.map(str::to_string)),
                is_active: Set(1),
                ..Default::default()
            };
            async move {
                devices::Entity::insert(model)
                    .on_conflict(
                        OnConflict::column(devices::Column::SerialNumber)
                            .update_columns([
                                devices::Column::Ip,
                                devices::Column::Port,
                                devices::Column::Name,
                                devices::Column::IsActive,
                            ])
                            .to_owned(),
                    )
                    .exec_without_returning(db)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    pub async fn delete_device(&self, serial_number: &str) -> std::result::Result<bool, DbErr> {
        let db = &self.db;
        let result = with_lock_retry(|| {
            let sn = serial_number.to_string();
            async move {
                devices::Entity::delete_many()
                    .filter(devices::Column::SerialNumber.eq(sn))
                    .exec(db)
                    .await
            }
        })
        .await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn get_active_devices(&self) -> std::result::Result<Vec<devices::Model>, DbErr> {
        let db = &self.db;
        with_lock_retry(|| async move {
            devices::Entity::find()
                .filter(devices::Column::IsActive.eq(1))
                .all(db)
                .await
        })
        .await
    }

    /// Stamp a device's last successful contact.
    pub async fn touch_device(&self, serial_number: &str) -> std::result::Result<(), DbErr> {
        let db = &self.db;
        let now = Utc::now();
        with_lock_retry(|| {
            let sn = serial_number.to_string();
            async move {
                devices::Entity::update_many()
                    .col_expr(devices::Column::LastSync, Expr::value(now))
                    .filter(devices::Column::SerialNumber.eq(sn))
                    .exec(db)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    /// Refresh the cached user table rows fetched from a device.
    pub async fn upsert_user(&self, user: &User) -> std::result::Result<(), DbErr> {
        let db = &self.db;
        let now = Utc::now();
        with_lock_retry(|| {
            let model = users::ActiveModel {
                user_id: Set(user.user_id.clone()),
                name: Set(Some(user.name.clone())),
                privilege: Set(Some(user.privilege as i32)),
                password: Set(Some(user.password.clone())),
                last_updated: Set(Some(now)),
            };
            async move {
                users::Entity::insert(model)
                    .on_conflict(
                        OnConflict::column(users::Column::UserId)
                            .update_columns([
                                users::Column::Name,
                                users::Column::Privilege,
                                users::Column::Password,
                                users::Column::LastUpdated,
                            ])
                            .to_owned(),
                    )
                    .exec_without_returning(db)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, user_id: &str) -> std::result::Result<Option<users::Model>, DbErr> {
        let db = &self.db;
        with_lock_retry(|| {
            let id = user_id.to_string();
            async move { users::Entity::find_by_id(id).one(db).await }
        })
        .await
    }
}

fn dedup_conflict() -> OnConflict {
    OnConflict::columns([
        attendance::Column::UserId,
        attendance::Column::PunchTime,
        attendance::Column::DeviceSn,
    ])
    .do_nothing()
    .to_owned()
}

fn is_locked(err: &DbErr) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("database is locked") || msg.contains("database table is locked")
}

/// Run a database operation, retrying lock contention with exponential
/// backoff (50ms base, 5 attempts).
async fn with_lock_retry<T, F, Fut>(mut op: F) -> std::result::Result<T, DbErr>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, DbErr>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if is_locked(&e) && attempt < LOCK_RETRY_MAX => {
                let delay = LOCK_RETRY_BASE * 2u32.pow(attempt);
                warn!(
                    "database locked, retrying in {delay:?} (attempt {}/{LOCK_RETRY_MAX})",
                    attempt + 1
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                debug!("database operation failed: {e}");
                return Err(e);
            }
            ok => return ok,
        }
    }
}
