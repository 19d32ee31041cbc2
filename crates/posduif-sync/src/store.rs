//! The seam between the sync core and the durable store.
//!
//! The tracker and manager only need this narrow slice of the store, so
//! they depend on the trait rather than on `sqlx` directly; tests swap in
//! an in-memory fake.

use async_trait::async_trait;
use uuid::Uuid;

use posduif_shared::{Message, MessageStatus, SyncMetadata};
use posduif_store::{Store, StoreError};

#[async_trait]
pub trait SyncStore: Send + Sync {
    /// The enrolled device for a user, if any. Web users have none.
    async fn device_for_user(&self, user_id: Uuid) -> Result<Option<String>, StoreError>;

    async fn sync_metadata(&self, device_id: &str) -> Result<Option<SyncMetadata>, StoreError>;

    async fn upsert_sync_metadata(&self, meta: &SyncMetadata) -> Result<(), StoreError>;

    async fn pending_messages_for_device(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;

    async fn update_message_status(
        &self,
        id: Uuid,
        status: MessageStatus,
    ) -> Result<(), StoreError>;

    async fn create_message(&self, msg: &Message) -> Result<Message, StoreError>;
}

#[async_trait]
impl SyncStore for Store {
    async fn device_for_user(&self, user_id: Uuid) -> Result<Option<String>, StoreError> {
        let user = self.user_by_id(user_id).await?;
        Ok(user
            .and_then(|u| u.device_id)
            .filter(|device| !device.is_empty()))
    }

    async fn sync_metadata(&self, device_id: &str) -> Result<Option<SyncMetadata>, StoreError> {
        Store::sync_metadata(self, device_id).await
    }

    async fn upsert_sync_metadata(&self, meta: &SyncMetadata) -> Result<(), StoreError> {
        Store::upsert_sync_metadata(self, meta).await
    }

    async fn pending_messages_for_device(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        Store::pending_messages_for_device(self, device_id, limit).await
    }

    async fn update_message_status(
        &self,
        id: Uuid,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        Store::update_message_status(self, id, status).await
    }

    async fn create_message(&self, msg: &Message) -> Result<Message, StoreError> {
        Store::create_message(self, msg).await
    }
}
