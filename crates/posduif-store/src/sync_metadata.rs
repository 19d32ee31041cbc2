use sqlx::postgres::PgRow;
use sqlx::Row;

use posduif_shared::{Lsn, SyncMetadata, SyncState};

use crate::database::Store;
use crate::error::{Result, StoreError};

impl Store {
    pub async fn sync_metadata(&self, device_id: &str) -> Result<Option<SyncMetadata>> {
        let row = sqlx::query(
            r#"
            SELECT id, device_id, last_sync_timestamp, last_synced_lsn,
                   pending_outgoing_count, sync_status, created_at, updated_at
              FROM sync_metadata
             WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_sync_metadata).transpose()
    }

    /// Write the device's sync bookkeeping, atomically by `device_id`.
    ///
    /// Callers are expected to carry the stored cursor forward when they are
    /// not advancing it; the cursor's monotonicity is a caller contract, the
    /// upsert itself overwrites.
    pub async fn upsert_sync_metadata(&self, meta: &SyncMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (id, device_id, last_sync_timestamp, last_synced_lsn,
                                       pending_outgoing_count, sync_status,
                                       created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (device_id) DO UPDATE
               SET last_sync_timestamp = EXCLUDED.last_sync_timestamp,
                   last_synced_lsn = EXCLUDED.last_synced_lsn,
                   pending_outgoing_count = EXCLUDED.pending_outgoing_count,
                   sync_status = EXCLUDED.sync_status,
                   updated_at = NOW()
            "#,
        )
        .bind(meta.id)
        .bind(&meta.device_id)
        .bind(meta.last_sync_timestamp)
        .bind(meta.last_synced_lsn.map(|lsn| lsn.to_string()))
        .bind(meta.pending_outgoing_count)
        .bind(meta.sync_status.as_str())
        .bind(meta.created_at)
        .bind(meta.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

fn row_to_sync_metadata(row: &PgRow) -> Result<SyncMetadata> {
    let sync_status: String = row.try_get("sync_status")?;
    let sync_status = SyncState::parse(&sync_status)
        .ok_or_else(|| StoreError::Decode(format!("unknown sync status {sync_status:?}")))?;

    // A cursor that does not parse is treated as absent; the device then
    // resyncs from the start of its queue, which at-least-once tolerates.
    let last_synced_lsn: Option<String> = row.try_get("last_synced_lsn")?;
    let last_synced_lsn = last_synced_lsn.and_then(|s| s.parse::<Lsn>().ok());

    Ok(SyncMetadata {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        last_sync_timestamp: row.try_get("last_sync_timestamp")?,
        last_synced_lsn,
        pending_outgoing_count: row.try_get("pending_outgoing_count")?,
        sync_status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
