//! Idempotent startup migrations.
//!
//! Every step is safe to re-run: base tables are `IF NOT EXISTS`, and the
//! two sync-cursor migrations check the catalog before altering anything.

use sqlx::postgres::PgPool;

use crate::error::{Result, StoreError};

pub async fn run(pool: &PgPool) -> Result<()> {
    create_base_tables(pool).await?;
    add_lsn_column(pool).await?;
    create_lsn_index(pool).await?;
    Ok(())
}

async fn create_base_tables(pool: &PgPool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id UUID PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            user_type TEXT NOT NULL DEFAULT 'web',
            device_id TEXT UNIQUE,
            online_status BOOLEAN NOT NULL DEFAULT FALSE,
            last_seen TIMESTAMPTZ,
            enrolled_at TIMESTAMPTZ,
            enrollment_token_id UUID,
            last_message_sent TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id UUID PRIMARY KEY,
            sender_id UUID NOT NULL REFERENCES users(id),
            recipient_id UUID NOT NULL REFERENCES users(id),
            content TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending_sync',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            synced_at TIMESTAMPTZ,
            read_at TIMESTAMPTZ
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_recipient_status
            ON messages (recipient_id, status)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS enrollment_tokens (
            id UUID PRIMARY KEY,
            token TEXT NOT NULL UNIQUE,
            created_by UUID NOT NULL,
            tenant_id TEXT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            used_at TIMESTAMPTZ,
            device_id TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sync_metadata (
            id UUID PRIMARY KEY,
            device_id TEXT NOT NULL UNIQUE,
            last_sync_timestamp TIMESTAMPTZ,
            pending_outgoing_count INTEGER NOT NULL DEFAULT 0,
            sync_status TEXT NOT NULL DEFAULT 'idle',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
    }

    Ok(())
}

/// The device resume cursor, stored in its canonical textual form.
async fn add_lsn_column(pool: &PgPool) -> Result<()> {
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM information_schema.columns
            WHERE table_name = 'sync_metadata'
              AND column_name = 'last_synced_lsn'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(|e| StoreError::Migration(e.to_string()))?;

    if exists {
        return Ok(());
    }

    tracing::info!("applying migration: add sync_metadata.last_synced_lsn");
    sqlx::query("ALTER TABLE sync_metadata ADD COLUMN last_synced_lsn TEXT")
        .execute(pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

    Ok(())
}

async fn create_lsn_index(pool: &PgPool) -> Result<()> {
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM pg_indexes
            WHERE tablename = 'sync_metadata'
              AND indexname = 'idx_sync_metadata_lsn'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(|e| StoreError::Migration(e.to_string()))?;

    if exists {
        return Ok(());
    }

    tracing::info!("applying migration: create idx_sync_metadata_lsn");
    sqlx::query(
        r#"
        CREATE INDEX idx_sync_metadata_lsn
            ON sync_metadata (last_synced_lsn)
            WHERE last_synced_lsn IS NOT NULL
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::Migration(e.to_string()))?;

    Ok(())
}
