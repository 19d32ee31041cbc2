use sqlx::postgres::PgRow;
use sqlx::{QueryBuilder, Row};
use uuid::Uuid;

use posduif_shared::{Message, MessageStatus};

use crate::database::Store;
use crate::error::{Result, StoreError};

const MESSAGE_COLUMNS: &str =
    "id, sender_id, recipient_id, content, status, created_at, updated_at, synced_at, read_at";

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub recipient_id: Option<Uuid>,
    pub status: Option<MessageStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Store {
    /// Persist a message, defaulting status to `pending_sync`.
    ///
    /// Empty (trimmed) content is rejected. A duplicate id is the retry
    /// signal of the sync protocol: if the stored row carries the same
    /// sender, recipient and content the call succeeds idempotently,
    /// otherwise it is a conflict.
    pub async fn create_message(&self, msg: &Message) -> Result<Message> {
        if msg.content.trim().is_empty() {
            return Err(StoreError::EmptyContent);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, sender_id, recipient_id, content, status,
                                  created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(msg.id)
        .bind(msg.sender_id)
        .bind(msg.recipient_id)
        .bind(&msg.content)
        .bind(msg.status.as_str())
        .bind(msg.created_at)
        .bind(msg.updated_at)
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(msg.clone()),
            Err(e) if StoreError::is_unique_violation(&e) => {
                // Redelivery of an already-persisted message.
                let stored = self
                    .message_by_id(msg.id)
                    .await?
                    .ok_or(StoreError::DuplicateMessage(msg.id))?;
                if stored.sender_id == msg.sender_id
                    && stored.recipient_id == msg.recipient_id
                    && stored.content == msg.content
                {
                    tracing::debug!(id = %msg.id, "duplicate upload matched stored row");
                    Ok(stored)
                } else {
                    Err(StoreError::DuplicateMessage(msg.id))
                }
            }
            Err(e) if StoreError::is_foreign_key_violation(&e) => Err(StoreError::Conflict(
                format!("sender or recipient does not exist: {e}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn message_by_id(&self, id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    /// List messages, newest first.
    pub async fn messages(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let mut query =
            QueryBuilder::new(format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE 1=1"));

        if let Some(recipient) = filter.recipient_id {
            query.push(" AND recipient_id = ");
            query.push_bind(recipient);
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ");
            query.push_bind(status.as_str());
        }
        query.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ");
            query.push_bind(limit);
        }
        if let Some(offset) = filter.offset {
            query.push(" OFFSET ");
            query.push_bind(offset);
        }

        let rows = query.build().fetch_all(self.pool()).await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Undelivered messages for an enrolled device, oldest first.
    pub async fn pending_messages_for_device(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.sender_id, m.recipient_id, m.content, m.status,
                   m.created_at, m.updated_at, m.synced_at, m.read_at
              FROM messages m
              JOIN users u ON m.recipient_id = u.id
             WHERE u.device_id = $1 AND m.status = 'pending_sync'
             ORDER BY m.created_at ASC
             LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    pub async fn unread_count(&self, user_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE recipient_id = $1 AND status != 'read'",
        )
        .bind(user_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Advance a message along the `pending_sync -> synced -> read` chain.
    ///
    /// Regressions are refused. The companion timestamp (`synced_at` or
    /// `read_at`) is stamped in the same statement, and only on first entry
    /// into the state.
    pub async fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE messages
               SET status = $2,
                   updated_at = NOW(),
                   synced_at = CASE
                       WHEN $2 = 'synced' AND synced_at IS NULL THEN NOW()
                       ELSE synced_at
                   END,
                   read_at = CASE
                       WHEN $2 = 'read' AND read_at IS NULL THEN NOW()
                       ELSE read_at
                   END
             WHERE id = $1
               AND array_position(ARRAY['pending_sync','synced','read'], status)
                <= array_position(ARRAY['pending_sync','synced','read'], $2)
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(self.pool())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Nothing updated: either the row is missing or the transition
        // would regress.
        match self.message_by_id(id).await? {
            None => Err(StoreError::NotFound),
            Some(stored) => Err(StoreError::StatusRegression {
                from: stored.status,
                to: status,
            }),
        }
    }
}

pub(crate) fn row_to_message(row: &PgRow) -> Result<Message> {
    let status: String = row.try_get("status")?;
    let status = MessageStatus::parse(&status)
        .ok_or_else(|| StoreError::Decode(format!("unknown message status {status:?}")))?;

    Ok(Message {
        id: row.try_get("id")?,
        sender_id: row.try_get("sender_id")?,
        recipient_id: row.try_get("recipient_id")?,
        content: row.try_get("content")?,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        synced_at: row.try_get("synced_at")?,
        read_at: row.try_get("read_at")?,
    })
}
