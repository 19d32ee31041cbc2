//! In-memory fake store and change builders for sync-core tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use posduif_shared::{Lsn, Message, MessageStatus, SyncMetadata};
use posduif_store::StoreError;

use crate::store::SyncStore;
use crate::wal::{WalChange, WalOp};

#[derive(Default)]
pub struct FakeStore {
    pub devices: Mutex<HashMap<Uuid, Option<String>>>,
    pub metadata: Mutex<HashMap<String, SyncMetadata>>,
    pub pending: Mutex<HashMap<String, Vec<Message>>>,
    pub statuses: Mutex<HashMap<Uuid, MessageStatus>>,
    pub created: Mutex<Vec<Message>>,
    /// Message ids whose creation should fail, with the error text.
    pub failing_creates: Mutex<HashMap<Uuid, String>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mobile_user(&self, device_id: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.devices
            .lock()
            .insert(id, Some(device_id.to_string()));
        id
    }

    pub fn add_web_user(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.devices.lock().insert(id, None);
        id
    }

    pub fn queue_pending(&self, device_id: &str, msg: Message) {
        self.pending
            .lock()
            .entry(device_id.to_string())
            .or_default()
            .push(msg);
    }

    pub fn fail_create(&self, id: Uuid, error: &str) {
        self.failing_creates.lock().insert(id, error.to_string());
    }

    pub fn cursor(&self, device_id: &str) -> Option<Lsn> {
        self.metadata
            .lock()
            .get(device_id)
            .and_then(|meta| meta.last_synced_lsn)
    }
}

#[async_trait]
impl SyncStore for FakeStore {
    async fn device_for_user(&self, user_id: Uuid) -> Result<Option<String>, StoreError> {
        Ok(self.devices.lock().get(&user_id).cloned().flatten())
    }

    async fn sync_metadata(&self, device_id: &str) -> Result<Option<SyncMetadata>, StoreError> {
        Ok(self.metadata.lock().get(device_id).cloned())
    }

    async fn upsert_sync_metadata(&self, meta: &SyncMetadata) -> Result<(), StoreError> {
        self.metadata
            .lock()
            .insert(meta.device_id.clone(), meta.clone());
        Ok(())
    }

    async fn pending_messages_for_device(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let pending = self.pending.lock();
        let statuses = self.statuses.lock();
        Ok(pending
            .get(device_id)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| {
                        statuses
                            .get(&m.id)
                            .copied()
                            .unwrap_or(m.status)
                            == MessageStatus::PendingSync
                    })
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_message_status(
        &self,
        id: Uuid,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        self.statuses.lock().insert(id, status);
        Ok(())
    }

    async fn create_message(&self, msg: &Message) -> Result<Message, StoreError> {
        if let Some(error) = self.failing_creates.lock().get(&msg.id) {
            return Err(StoreError::Conflict(error.clone()));
        }
        self.created.lock().push(msg.clone());
        Ok(msg.clone())
    }
}

// ─── Change builders ───

pub fn change(lsn: u64, op: WalOp) -> WalChange {
    WalChange {
        lsn: Lsn(lsn),
        schema: "public".to_string(),
        table: "messages".to_string(),
        op,
        columns: HashMap::new(),
        old_columns: HashMap::new(),
        commit_time: Utc::now(),
    }
}

pub fn insert_change(lsn: u64, sender: Uuid, recipient: Uuid, content: &str) -> WalChange {
    let mut c = change(lsn, WalOp::Insert);
    c.columns
        .insert("id".into(), Uuid::new_v4().to_string().into());
    c.columns.insert("sender_id".into(), sender.to_string().into());
    c.columns
        .insert("recipient_id".into(), recipient.to_string().into());
    c.columns.insert("content".into(), content.into());
    c
}

pub fn update_change(
    lsn: u64,
    sender: Uuid,
    old_sender: Option<Uuid>,
    recipient: Uuid,
) -> WalChange {
    let mut c = change(lsn, WalOp::Update);
    c.columns
        .insert("id".into(), Uuid::new_v4().to_string().into());
    c.columns.insert("sender_id".into(), sender.to_string().into());
    c.columns
        .insert("recipient_id".into(), recipient.to_string().into());
    c.columns.insert("content".into(), "edited".into());
    c.columns.insert("status".into(), "synced".into());
    if let Some(old) = old_sender {
        c.old_columns
            .insert("sender_id".into(), old.to_string().into());
        c.old_columns
            .insert("recipient_id".into(), recipient.to_string().into());
    }
    c
}
