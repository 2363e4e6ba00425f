//! Configured devices, mirrored into the store for inspection.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "devices")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub ip: String,
    pub port: i32,
    #[sea_orm(unique)]
    pub serial_number: String,
    pub name: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub is_active: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
