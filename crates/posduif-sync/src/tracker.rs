//! Per-device change tracking.
//!
//! The tracker is the fan-out hub between the WAL stream and the sync
//! protocol. It keeps one LSN-ordered queue of pending changes per enrolled
//! device. The WAL service is the only writer; request handlers read
//! concurrently, and reclamation takes the write lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use posduif_shared::Lsn;

use crate::error::Result;
use crate::store::SyncStore;
use crate::wal::{WalChange, WalOp};

pub struct ChangeTracker {
    store: Arc<dyn SyncStore>,
    queues: RwLock<HashMap<String, Vec<Arc<WalChange>>>>,
}

impl ChangeTracker {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self {
            store,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a change and fan it out to recipient devices.
    ///
    /// Only `messages` inserts and updates are admitted. The recipient's
    /// devices receive the change, minus every device belonging to the
    /// sender (old or new sender for updates). That exclusion is the
    /// sender-loop suppression rule: a device never hears about rows it
    /// authored, and a self-message reaches no device at all.
    pub async fn add_change(&self, change: WalChange) -> Result<()> {
        if change.table != "messages" {
            return Ok(());
        }
        if !matches!(change.op, WalOp::Insert | WalOp::Update) {
            return Ok(());
        }

        let recipient_id = match extract_recipient(&change) {
            Some(id) => id,
            None => return Ok(()),
        };

        let sender_id = change.column_str("sender_id").and_then(parse_uuid);
        let old_sender_id = match change.op {
            WalOp::Update => change.old_column_str("sender_id").and_then(parse_uuid),
            _ => None,
        };
        if sender_id.is_none() && old_sender_id.is_none() {
            return Ok(());
        }

        let recipient_devices = self.devices_for(recipient_id).await?;
        if recipient_devices.is_empty() {
            return Ok(());
        }

        let mut sender_devices = HashSet::new();
        if let Some(sender) = sender_id {
            sender_devices.extend(self.devices_for(sender).await?);
        }
        if let Some(old_sender) = old_sender_id.filter(|old| Some(*old) != sender_id) {
            sender_devices.extend(self.devices_for(old_sender).await?);
        }

        let targets: Vec<String> = recipient_devices
            .into_iter()
            .filter(|device| !sender_devices.contains(device))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        tracing::debug!(
            lsn = %change.lsn,
            op = %change.op,
            devices = targets.len(),
            "queueing change"
        );

        let change = Arc::new(change);
        let mut queues = self.queues.write();
        for device in targets {
            queues.entry(device).or_default().push(Arc::clone(&change));
        }

        Ok(())
    }

    /// Pending changes for a device past its persisted cursor, LSN order,
    /// up to `limit`. A device with no cursor gets everything queued.
    pub async fn changes_for_device(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<Arc<WalChange>>> {
        let cursor = self
            .store
            .sync_metadata(device_id)
            .await?
            .and_then(|meta| meta.last_synced_lsn);

        let queues = self.queues.read();
        let Some(queue) = queues.get(device_id) else {
            return Ok(Vec::new());
        };

        Ok(queue
            .iter()
            .filter(|change| cursor.map_or(true, |cursor| change.lsn > cursor))
            .take(limit)
            .cloned()
            .collect())
    }

    /// Drop everything at or below `up_to` from the device's queue.
    ///
    /// This is the only way tracker memory is reclaimed; the sync manager
    /// calls it after the cursor has been durably advanced.
    pub fn clear_changes(&self, device_id: &str, up_to: Lsn) {
        let mut queues = self.queues.write();
        if let Some(queue) = queues.get_mut(device_id) {
            queue.retain(|change| change.lsn > up_to);
            if queue.is_empty() {
                queues.remove(device_id);
            }
        }
    }

    async fn devices_for(&self, user_id: Uuid) -> Result<Vec<String>> {
        Ok(self
            .store
            .device_for_user(user_id)
            .await?
            .into_iter()
            .collect())
    }
}

fn extract_recipient(change: &WalChange) -> Option<Uuid> {
    change
        .column_str("recipient_id")
        .and_then(parse_uuid)
        .or_else(|| match change.op {
            WalOp::Update => change.old_column_str("recipient_id").and_then(parse_uuid),
            _ => None,
        })
}

fn parse_uuid(s: &str) -> Option<Uuid> {
    Uuid::parse_str(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{change, insert_change, update_change, FakeStore};
    use chrono::Utc;
    use posduif_shared::{SyncMetadata, SyncState};

    fn tracker_with(store: FakeStore) -> (ChangeTracker, Arc<FakeStore>) {
        let store = Arc::new(store);
        (ChangeTracker::new(store.clone()), store)
    }

    #[tokio::test]
    async fn delivers_to_recipient_device() {
        let store = FakeStore::new();
        let alice = store.add_mobile_user("dev-a");
        let bob = store.add_mobile_user("dev-b");
        let (tracker, _) = tracker_with(store);

        tracker
            .add_change(insert_change(1, alice, bob, "hi"))
            .await
            .unwrap();

        let batch = tracker.changes_for_device("dev-b", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].lsn, Lsn(1));
    }

    #[tokio::test]
    async fn suppresses_sender_loop() {
        let store = FakeStore::new();
        let alice = store.add_mobile_user("dev-a");
        let bob = store.add_mobile_user("dev-b");
        let (tracker, _) = tracker_with(store);

        tracker
            .add_change(insert_change(1, alice, bob, "hi"))
            .await
            .unwrap();

        // The sender's own device never sees the change.
        let batch = tracker.changes_for_device("dev-a", 10).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn self_message_reaches_no_device() {
        let store = FakeStore::new();
        let alice = store.add_mobile_user("dev-a");
        let (tracker, _) = tracker_with(store);

        tracker
            .add_change(insert_change(1, alice, alice, "note to self"))
            .await
            .unwrap();

        let batch = tracker.changes_for_device("dev-a", 10).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn web_sender_excludes_nothing() {
        let store = FakeStore::new();
        let web = store.add_web_user();
        let bob = store.add_mobile_user("dev-b");
        let (tracker, _) = tracker_with(store);

        tracker
            .add_change(insert_change(1, web, bob, "from browser"))
            .await
            .unwrap();

        let batch = tracker.changes_for_device("dev-b", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn update_excludes_both_old_and_new_sender() {
        let store = FakeStore::new();
        let old_sender = store.add_mobile_user("dev-old");
        let new_sender = store.add_mobile_user("dev-new");
        let recipient = store.add_mobile_user("dev-r");
        let (tracker, _) = tracker_with(store);

        // The recipient happens to share a queue with neither sender.
        tracker
            .add_change(update_change(5, new_sender, Some(old_sender), recipient))
            .await
            .unwrap();

        assert_eq!(tracker.changes_for_device("dev-r", 10).await.unwrap().len(), 1);
        assert!(tracker.changes_for_device("dev-old", 10).await.unwrap().is_empty());
        assert!(tracker.changes_for_device("dev-new", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drops_non_message_tables_and_deletes() {
        let store = FakeStore::new();
        let alice = store.add_mobile_user("dev-a");
        let bob = store.add_mobile_user("dev-b");
        let (tracker, _) = tracker_with(store);

        let mut other_table = insert_change(1, alice, bob, "hi");
        other_table.table = "users".to_string();
        tracker.add_change(other_table).await.unwrap();

        let mut delete = insert_change(2, alice, bob, "hi");
        delete.op = WalOp::Delete;
        tracker.add_change(delete).await.unwrap();

        assert!(tracker.changes_for_device("dev-b", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drops_changes_without_recipient() {
        let store = FakeStore::new();
        let alice = store.add_mobile_user("dev-a");
        store.add_mobile_user("dev-b");
        let (tracker, _) = tracker_with(store);

        let mut no_recipient = change(3, WalOp::Insert);
        no_recipient
            .columns
            .insert("sender_id".into(), alice.to_string().into());
        tracker.add_change(no_recipient).await.unwrap();

        assert!(tracker.changes_for_device("dev-b", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cursor_filters_delivered_changes() {
        let store = FakeStore::new();
        let alice = store.add_mobile_user("dev-a");
        let bob = store.add_mobile_user("dev-b");
        let (tracker, store) = tracker_with(store);

        for lsn in 1..=5 {
            tracker
                .add_change(insert_change(lsn, alice, bob, "hi"))
                .await
                .unwrap();
        }

        let mut meta = SyncMetadata::idle("dev-b");
        meta.last_synced_lsn = Some(Lsn(3));
        meta.sync_status = SyncState::Idle;
        meta.last_sync_timestamp = Some(Utc::now());
        store.upsert_sync_metadata(&meta).await.unwrap();

        let batch = tracker.changes_for_device("dev-b", 10).await.unwrap();
        let lsns: Vec<u64> = batch.iter().map(|c| c.lsn.0).collect();
        assert_eq!(lsns, vec![4, 5]);
    }

    #[tokio::test]
    async fn limit_preserves_lsn_order() {
        let store = FakeStore::new();
        let alice = store.add_mobile_user("dev-a");
        let bob = store.add_mobile_user("dev-b");
        let (tracker, _) = tracker_with(store);

        for lsn in 1..=5 {
            tracker
                .add_change(insert_change(lsn, alice, bob, "hi"))
                .await
                .unwrap();
        }

        let batch = tracker.changes_for_device("dev-b", 2).await.unwrap();
        let lsns: Vec<u64> = batch.iter().map(|c| c.lsn.0).collect();
        assert_eq!(lsns, vec![1, 2]);
    }

    #[tokio::test]
    async fn clear_reclaims_up_to_lsn() {
        let store = FakeStore::new();
        let alice = store.add_mobile_user("dev-a");
        let bob = store.add_mobile_user("dev-b");
        let (tracker, _) = tracker_with(store);

        for lsn in 1..=4 {
            tracker
                .add_change(insert_change(lsn, alice, bob, "hi"))
                .await
                .unwrap();
        }
        tracker.clear_changes("dev-b", Lsn(2));

        let batch = tracker.changes_for_device("dev-b", 10).await.unwrap();
        let lsns: Vec<u64> = batch.iter().map(|c| c.lsn.0).collect();
        assert_eq!(lsns, vec![3, 4]);
    }

    #[tokio::test]
    async fn fetch_clear_cycles_cover_everything_once() {
        // Drain in batches; the union of batches must be every admitted
        // change exactly once, in LSN order.
        let store = FakeStore::new();
        let alice = store.add_mobile_user("dev-a");
        let bob = store.add_mobile_user("dev-b");
        let (tracker, store) = tracker_with(store);

        for lsn in 1..=23 {
            tracker
                .add_change(insert_change(lsn, alice, bob, "hi"))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        loop {
            let batch = tracker.changes_for_device("dev-b", 5).await.unwrap();
            if batch.is_empty() {
                break;
            }
            let max = batch.iter().map(|c| c.lsn).max().unwrap();
            seen.extend(batch.iter().map(|c| c.lsn.0));

            // Cursor advances before the tracker reclaims.
            let mut meta = SyncMetadata::idle("dev-b");
            meta.last_synced_lsn = Some(max);
            store.upsert_sync_metadata(&meta).await.unwrap();
            tracker.clear_changes("dev-b", max);
        }

        assert_eq!(seen, (1..=23).collect::<Vec<u64>>());
    }
}
