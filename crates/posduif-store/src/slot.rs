//! Logical replication slot management.
//!
//! One slot per tenant database, named after the database, bound to the
//! `pgoutput` decoding plugin. Creation is idempotent so restarts reuse the
//! slot (and its retained WAL) instead of minting a new one.

use sqlx::postgres::PgPool;
use sqlx::Row;

use posduif_shared::Lsn;

use crate::error::{Result, StoreError};

/// Decoding plugin the slot is bound to.
pub const PLUGIN_NAME: &str = "pgoutput";

/// Publication streamed through the slot. pgoutput refuses to decode
/// without one; it covers exactly the `messages` table.
pub const PUBLICATION_NAME: &str = "posduif_sync_pub";

const SLOT_PREFIX: &str = "posduif_sync_";

/// PostgreSQL caps replication identifier names at 63 bytes.
const MAX_SLOT_NAME_LEN: usize = 63;

#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub slot_name: String,
    pub plugin: String,
    pub slot_type: String,
    pub active: bool,
    pub restart_lsn: Option<Lsn>,
    pub confirmed_flush_lsn: Option<Lsn>,
}

#[derive(Clone)]
pub struct SlotManager {
    pool: PgPool,
    db_name: String,
}

impl SlotManager {
    pub fn new(pool: PgPool, db_name: impl Into<String>) -> Self {
        Self {
            pool,
            db_name: db_name.into(),
        }
    }

    /// The tenant's slot name: sanitized database name under a fixed prefix,
    /// truncated to what PostgreSQL accepts.
    pub fn slot_name(&self) -> String {
        derive_slot_name(&self.db_name)
    }

    /// Create the tenant's derived slot if it does not exist yet.
    /// Returns the slot name.
    pub async fn create_slot(&self) -> Result<String> {
        self.create_slot_named(&self.slot_name()).await
    }

    /// Idempotently create a slot under an explicit name.
    pub async fn create_slot_named(&self, slot_name: &str) -> Result<String> {
        if self.slot_exists(slot_name).await? {
            tracing::debug!(slot = %slot_name, "replication slot already exists");
            return Ok(slot_name.to_string());
        }

        let created: String = sqlx::query_scalar(
            "SELECT slot_name FROM pg_create_logical_replication_slot($1, $2)",
        )
        .bind(slot_name)
        .bind(PLUGIN_NAME)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(slot = %created, plugin = PLUGIN_NAME, "created replication slot");
        Ok(created)
    }

    pub async fn slot_exists(&self, slot_name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
        )
        .bind(slot_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn slot_info(&self, slot_name: &str) -> Result<SlotInfo> {
        let row = sqlx::query(
            r#"
            SELECT slot_name, plugin, slot_type, active,
                   restart_lsn::text AS restart_lsn,
                   confirmed_flush_lsn::text AS confirmed_flush_lsn
              FROM pg_replication_slots
             WHERE slot_name = $1
            "#,
        )
        .bind(slot_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        let restart_lsn: Option<String> = row.try_get("restart_lsn")?;
        let confirmed_flush_lsn: Option<String> = row.try_get("confirmed_flush_lsn")?;

        Ok(SlotInfo {
            slot_name: row.try_get("slot_name")?,
            plugin: row.try_get("plugin")?,
            slot_type: row.try_get("slot_type")?,
            active: row.try_get("active")?,
            restart_lsn: restart_lsn.and_then(|s| s.parse().ok()),
            confirmed_flush_lsn: confirmed_flush_lsn.and_then(|s| s.parse().ok()),
        })
    }

    pub async fn drop_slot(&self, slot_name: &str) -> Result<()> {
        sqlx::query("SELECT pg_drop_replication_slot($1)")
            .bind(slot_name)
            .execute(&self.pool)
            .await?;
        tracing::info!(slot = %slot_name, "dropped replication slot");
        Ok(())
    }

    /// Create the `messages` publication if it does not exist yet.
    pub async fn ensure_publication(&self) -> Result<()> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_publication WHERE pubname = $1)",
        )
        .bind(PUBLICATION_NAME)
        .fetch_one(&self.pool)
        .await?;

        if exists {
            return Ok(());
        }

        sqlx::query(&format!(
            "CREATE PUBLICATION {PUBLICATION_NAME} FOR TABLE messages"
        ))
        .execute(&self.pool)
        .await?;

        tracing::info!(publication = PUBLICATION_NAME, "created publication");
        Ok(())
    }

    /// The server's current WAL write position.
    pub async fn current_wal_lsn(&self) -> Result<Lsn> {
        let lsn: String = sqlx::query_scalar("SELECT pg_current_wal_lsn()::text")
            .fetch_one(&self.pool)
            .await?;
        lsn.parse()
            .map_err(|e| StoreError::Decode(format!("bad pg_current_wal_lsn {lsn:?}: {e}")))
    }

    /// Where replication should resume: the slot's confirmed flush position,
    /// or the current WAL head for a slot that has never been consumed.
    pub async fn start_lsn(&self, slot_name: &str) -> Result<Lsn> {
        let info = self.slot_info(slot_name).await?;
        match info.confirmed_flush_lsn {
            Some(lsn) => Ok(lsn),
            None => self.current_wal_lsn().await,
        }
    }
}

fn derive_slot_name(db_name: &str) -> String {
    let sanitized = db_name.replace('-', "_");
    let mut name = format!("{SLOT_PREFIX}{sanitized}");
    if name.len() > MAX_SLOT_NAME_LEN {
        let mut cut = MAX_SLOT_NAME_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_name_replaces_dashes() {
        assert_eq!(derive_slot_name("tenant-a"), "posduif_sync_tenant_a");
    }

    #[test]
    fn slot_name_passes_through_plain_names() {
        assert_eq!(derive_slot_name("posduif"), "posduif_sync_posduif");
    }

    #[test]
    fn slot_name_truncates_to_63_bytes() {
        let long = "x".repeat(100);
        let name = derive_slot_name(&long);
        assert_eq!(name.len(), 63);
        assert!(name.starts_with("posduif_sync_x"));
    }
}
