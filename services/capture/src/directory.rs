//! Device directory boundary.

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered camera device, as resolved at trigger time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DeviceRecord {
    /// Internal primary key
    pub id: i64,
    /// External identifier used in bus topics
    pub device_id: String,
    /// Owning user
    pub owner_id: i64,
    /// Display name
    pub name: String,
}

/// Resolves external device identifiers to their internal records.
///
/// Lookups are fresh on every call; nothing is cached across sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Returns `None` for unknown or inactive devices.
    async fn lookup(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError>;
}
