//! Captured punch rows awaiting (or done with) backend sync.

use chrono::{DateTime, NaiveDateTime, Utc};
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "attendance")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// User id as reported by the device; alphanumeric on newer firmware.
    pub user_id: String,
    /// Device-local punch time, second precision.
    pub punch_time: NaiveDateTime,
    pub device_ip: String,
    pub device_sn: String,
    /// Device verify mode (fingerprint, face, card, ...).
    pub verify_type: i32,
    /// In/out/break code.
    pub punch: i32,
    /// Internal 16-bit device index, when the record layout carried one.
    pub device_uid: Option<i32>,
    /// Sync state: `pending` or `synced`.
    pub status: String,
    pub sync_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
