use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lsn::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(SyncState::Idle),
            "syncing" => Some(SyncState::Syncing),
            "error" => Some(SyncState::Error),
            _ => None,
        }
    }
}

/// Per-device sync bookkeeping.
///
/// `last_synced_lsn` is the device's resume cursor into the change stream;
/// it is non-decreasing for the lifetime of the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMetadata {
    pub id: Uuid,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_lsn: Option<Lsn>,
    pub pending_outgoing_count: i32,
    pub sync_status: SyncState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncMetadata {
    /// Fresh idle metadata for a device that has never synced.
    pub fn idle(device_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            last_sync_timestamp: None,
            last_synced_lsn: None,
            pending_outgoing_count: 0,
            sync_status: SyncState::Idle,
            created_at: now,
            updated_at: now,
        }
    }
}
