//! The sync manager orchestrates a device's fetch/ack cycle.
//!
//! Two delivery modes exist. WAL mode drains the device's tracker queue and
//! advances the persisted LSN cursor; polling mode falls back to querying
//! the store for `pending_sync` rows and advancing their status. Both are
//! at-least-once: a crash after delivery but before acknowledgement leads
//! to redelivery, which clients dedupe by message id.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use posduif_shared::wire::FailedMessage;
use posduif_shared::{Lsn, Message, MessageStatus, SyncMetadata, SyncState};

use crate::error::Result;
use crate::store::SyncStore;
use crate::tracker::ChangeTracker;
use crate::wal::{WalChange, WalOp};

pub struct SyncManager {
    store: Arc<dyn SyncStore>,
    tracker: Arc<ChangeTracker>,
    wal_enabled: bool,
}

#[derive(Debug, Default)]
pub struct OutgoingSummary {
    pub synced_count: usize,
    pub failed_count: usize,
    pub failed_messages: Vec<FailedMessage>,
    /// Ids that were persisted, for post-upload bookkeeping.
    pub stored: Vec<Message>,
}

impl SyncManager {
    pub fn new(store: Arc<dyn SyncStore>, tracker: Arc<ChangeTracker>, wal_enabled: bool) -> Self {
        Self {
            store,
            tracker,
            wal_enabled,
        }
    }

    /// Fetch the next batch of incoming messages for a device.
    pub async fn sync_incoming(&self, device_id: &str, limit: usize) -> Result<Vec<Message>> {
        if self.wal_enabled {
            self.sync_incoming_wal(device_id, limit).await
        } else {
            self.sync_incoming_polling(device_id, limit).await
        }
    }

    async fn sync_incoming_wal(&self, device_id: &str, limit: usize) -> Result<Vec<Message>> {
        let changes = self.tracker.changes_for_device(device_id, limit).await?;

        let mut messages = Vec::with_capacity(changes.len());
        let mut max_lsn: Option<Lsn> = None;
        for change in &changes {
            let Some(msg) = wal_change_to_message(change) else {
                tracing::debug!(lsn = %change.lsn, "skipping untranslatable change");
                continue;
            };
            messages.push(msg);
            max_lsn = Some(max_lsn.map_or(change.lsn, |m| m.max(change.lsn)));
        }

        if let Some(max_lsn) = max_lsn {
            // Advance the cursor first; only then reclaim tracker memory.
            // A crash in between redelivers, which is the contract.
            let mut meta = self
                .store
                .sync_metadata(device_id)
                .await?
                .unwrap_or_else(|| SyncMetadata::idle(device_id));
            meta.last_synced_lsn = Some(max_lsn);
            meta.last_sync_timestamp = Some(Utc::now());
            meta.sync_status = SyncState::Idle;
            self.store.upsert_sync_metadata(&meta).await?;

            self.tracker.clear_changes(device_id, max_lsn);

            tracing::debug!(
                device_id = %device_id,
                count = messages.len(),
                cursor = %max_lsn,
                "delivered WAL batch"
            );
        }

        Ok(messages)
    }

    async fn sync_incoming_polling(&self, device_id: &str, limit: usize) -> Result<Vec<Message>> {
        let pending = self
            .store
            .pending_messages_for_device(device_id, limit as i64)
            .await?;

        let now = Utc::now();
        let mut delivered = Vec::with_capacity(pending.len());
        for mut msg in pending {
            self.store
                .update_message_status(msg.id, MessageStatus::Synced)
                .await?;
            msg.status = MessageStatus::Synced;
            msg.synced_at = Some(now);
            msg.updated_at = now;
            delivered.push(msg);
        }

        Ok(delivered)
    }

    /// Persist device-authored messages, collecting per-item failures.
    ///
    /// One bad message never fails the batch; the caller reports the
    /// failing subset so the client retries only those.
    pub async fn sync_outgoing(&self, messages: Vec<Message>) -> OutgoingSummary {
        let mut summary = OutgoingSummary::default();

        for msg in messages {
            match self.store.create_message(&msg).await {
                Ok(stored) => {
                    summary.synced_count += 1;
                    summary.stored.push(stored);
                }
                Err(e) => {
                    tracing::warn!(id = %msg.id, error = %e, "outgoing message rejected");
                    summary.failed_count += 1;
                    summary.failed_messages.push(FailedMessage {
                        message_id: msg.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        summary
    }

    /// The device's sync bookkeeping, created lazily on first ask.
    pub async fn sync_status(&self, device_id: &str) -> Result<SyncMetadata> {
        if let Some(meta) = self.store.sync_metadata(device_id).await? {
            return Ok(meta);
        }

        let meta = SyncMetadata::idle(device_id);
        self.store.upsert_sync_metadata(&meta).await?;
        Ok(meta)
    }
}

/// Translate a WAL row image into the message record a device observes.
///
/// Identity columns must be present and well-formed or the change is
/// untranslatable; everything else degrades to a default. A column that is
/// present but fails to parse as its target type counts as absent.
pub fn wal_change_to_message(change: &WalChange) -> Option<Message> {
    if !matches!(change.op, WalOp::Insert | WalOp::Update) {
        return None;
    }

    let id = column_uuid(change, "id")?;
    let sender_id = column_uuid(change, "sender_id")?;
    let recipient_id = column_uuid(change, "recipient_id")?;
    let content = change.column_str("content")?.to_string();

    let status = change
        .column_str("status")
        .and_then(MessageStatus::parse)
        .unwrap_or(MessageStatus::PendingSync);

    Some(Message {
        id,
        sender_id,
        recipient_id,
        content,
        status,
        created_at: column_time(change, "created_at").unwrap_or(change.commit_time),
        updated_at: column_time(change, "updated_at").unwrap_or(change.commit_time),
        synced_at: column_time(change, "synced_at"),
        read_at: column_time(change, "read_at"),
    })
}

fn column_uuid(change: &WalChange, name: &str) -> Option<Uuid> {
    change.column_str(name).and_then(|s| Uuid::parse_str(s).ok())
}

/// Timestamps arrive in PostgreSQL's text output form
/// (`2026-08-02 12:34:56.789+00`); RFC 3339 is accepted as well.
fn column_time(change: &WalChange, name: &str) -> Option<DateTime<Utc>> {
    let text = change.column_str(name)?;
    parse_pg_timestamp(text)
}

fn parse_pg_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    // Timestamps without a zone are taken as UTC.
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{insert_change, FakeStore};
    use chrono::TimeZone;
    use serde_json::json;

    fn manager(store: Arc<FakeStore>, wal_enabled: bool) -> SyncManager {
        let tracker = Arc::new(ChangeTracker::new(store.clone()));
        SyncManager::new(store, tracker, wal_enabled)
    }

    fn manager_with_tracker(
        store: Arc<FakeStore>,
        wal_enabled: bool,
    ) -> (SyncManager, Arc<ChangeTracker>) {
        let tracker = Arc::new(ChangeTracker::new(store.clone()));
        (
            SyncManager::new(store, tracker.clone(), wal_enabled),
            tracker,
        )
    }

    #[tokio::test]
    async fn wal_sync_advances_cursor_and_clears_queue() {
        let store = Arc::new(FakeStore::new());
        let alice = store.add_mobile_user("dev-a");
        let bob = store.add_mobile_user("dev-b");
        let (manager, tracker) = manager_with_tracker(store.clone(), true);

        for lsn in [3u64, 7, 5] {
            tracker
                .add_change(insert_change(lsn, alice, bob, "hi"))
                .await
                .unwrap();
        }

        let batch = manager.sync_incoming("dev-b", 100).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(store.cursor("dev-b"), Some(Lsn(7)));

        // The queue was reclaimed: an immediate second call is empty.
        let again = manager.sync_incoming("dev-b", 100).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(store.cursor("dev-b"), Some(Lsn(7)));
    }

    #[tokio::test]
    async fn wal_sync_with_empty_queue_leaves_cursor_alone() {
        let store = Arc::new(FakeStore::new());
        store.add_mobile_user("dev-b");
        let manager = manager(store.clone(), true);

        let batch = manager.sync_incoming("dev-b", 100).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(store.cursor("dev-b"), None);
    }

    #[tokio::test]
    async fn redelivery_does_not_regress_cursor() {
        let store = Arc::new(FakeStore::new());
        let alice = store.add_mobile_user("dev-a");
        let bob = store.add_mobile_user("dev-b");
        let (manager, tracker) = manager_with_tracker(store.clone(), true);

        tracker
            .add_change(insert_change(0x10, alice, bob, "hi"))
            .await
            .unwrap();
        manager.sync_incoming("dev-b", 100).await.unwrap();
        assert_eq!(store.cursor("dev-b"), Some(Lsn(0x10)));

        // A stale entry below the cursor shows up again (redelivery into
        // the tracker); the batch stays empty and the cursor holds.
        tracker
            .add_change(insert_change(0x0F, alice, bob, "old"))
            .await
            .unwrap();
        let batch = manager.sync_incoming("dev-b", 100).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(store.cursor("dev-b"), Some(Lsn(0x10)));
    }

    #[tokio::test]
    async fn successive_batches_are_strictly_ordered() {
        let store = Arc::new(FakeStore::new());
        let alice = store.add_mobile_user("dev-a");
        let bob = store.add_mobile_user("dev-b");
        let (manager, tracker) = manager_with_tracker(store.clone(), true);

        for lsn in 1..=10u64 {
            tracker
                .add_change(insert_change(lsn, alice, bob, "hi"))
                .await
                .unwrap();
        }

        let first = manager.sync_incoming("dev-b", 4).await.unwrap();
        let cursor_after_first = store.cursor("dev-b").unwrap();
        let second = manager.sync_incoming("dev-b", 4).await.unwrap();
        let cursor_after_second = store.cursor("dev-b").unwrap();

        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 4);
        // max(lsn(B1)) < min(lsn(B2)): the cursor strictly advanced and no
        // message appears in both batches.
        assert!(cursor_after_first < cursor_after_second);
        for msg in &second {
            assert!(!first.iter().any(|m| m.id == msg.id));
        }
    }

    #[tokio::test]
    async fn polling_sync_advances_status() {
        let store = Arc::new(FakeStore::new());
        let alice = store.add_web_user();
        let bob = store.add_mobile_user("dev-b");
        let manager = manager(store.clone(), false);

        let msg = Message::new(alice, bob, "hi".into());
        store.queue_pending("dev-b", msg.clone());

        let batch = manager.sync_incoming("dev-b", 100).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].status, MessageStatus::Synced);
        assert!(batch[0].synced_at.is_some());
        assert_eq!(
            store.statuses.lock().get(&msg.id),
            Some(&MessageStatus::Synced)
        );

        // Second call: nothing pending any more.
        let again = manager.sync_incoming("dev-b", 100).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn outgoing_collects_partial_failures() {
        let store = Arc::new(FakeStore::new());
        let alice = store.add_mobile_user("dev-a");
        let bob = store.add_mobile_user("dev-b");
        let manager = manager(store.clone(), true);

        let good_1 = Message::new(alice, bob, "one".into());
        let bad = Message::new(alice, bob, "two".into());
        let good_2 = Message::new(alice, bob, "three".into());
        store.fail_create(bad.id, "recipient does not exist");

        let summary = manager
            .sync_outgoing(vec![good_1, bad.clone(), good_2])
            .await;

        assert_eq!(summary.synced_count, 2);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.failed_messages.len(), 1);
        assert_eq!(summary.failed_messages[0].message_id, bad.id);
        assert!(summary.failed_messages[0]
            .error
            .contains("recipient does not exist"));
    }

    #[tokio::test]
    async fn status_creates_default_lazily() {
        let store = Arc::new(FakeStore::new());
        let manager = manager(store.clone(), true);

        let meta = manager.sync_status("dev-z").await.unwrap();
        assert_eq!(meta.sync_status, SyncState::Idle);
        assert_eq!(meta.pending_outgoing_count, 0);
        assert!(store.metadata.lock().contains_key("dev-z"));
    }

    #[test]
    fn converts_insert_change_to_message() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let change = insert_change(9, alice, bob, "hallo");
        let msg = wal_change_to_message(&change).unwrap();

        assert_eq!(msg.sender_id, alice);
        assert_eq!(msg.recipient_id, bob);
        assert_eq!(msg.content, "hallo");
        assert_eq!(msg.status, MessageStatus::PendingSync);
        // Missing timestamps default to the commit time.
        assert_eq!(msg.created_at, change.commit_time);
        assert_eq!(msg.updated_at, change.commit_time);
    }

    #[test]
    fn wrong_typed_column_counts_as_absent() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut change = insert_change(9, alice, bob, "hallo");
        change.columns.insert("status".into(), json!("nonsense"));
        change.columns.insert("created_at".into(), json!(12345));

        let msg = wal_change_to_message(&change).unwrap();
        assert_eq!(msg.status, MessageStatus::PendingSync);
        assert_eq!(msg.created_at, change.commit_time);
    }

    #[test]
    fn change_without_identity_is_untranslatable() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut change = insert_change(9, alice, bob, "hallo");
        change.columns.remove("id");
        assert!(wal_change_to_message(&change).is_none());

        let mut bad_uuid = insert_change(10, alice, bob, "hallo");
        bad_uuid
            .columns
            .insert("recipient_id".into(), json!("not-a-uuid"));
        assert!(wal_change_to_message(&bad_uuid).is_none());
    }

    #[test]
    fn parses_pg_and_rfc3339_timestamps() {
        let expected = Utc.with_ymd_and_hms(2026, 8, 2, 12, 30, 45).unwrap();
        for text in [
            "2026-08-02 12:30:45+00",
            "2026-08-02 12:30:45+00:00",
            "2026-08-02T12:30:45Z",
            "2026-08-02 12:30:45",
        ] {
            assert_eq!(parse_pg_timestamp(text), Some(expected), "failed: {text}");
        }
        assert_eq!(
            parse_pg_timestamp("2026-08-02 12:30:45.5+00"),
            Some(expected + chrono::Duration::milliseconds(500))
        );
        assert_eq!(parse_pg_timestamp("yesterday"), None);
    }
}
