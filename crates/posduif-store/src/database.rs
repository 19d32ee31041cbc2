//! Connection management for the authoritative PostgreSQL store.
//!
//! [`Store`] owns a [`sqlx::PgPool`] and guarantees that migrations have run
//! before any other operation. One store instance serves one tenant
//! database; the database name doubles as the tenant id.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::error::Result;
use crate::migrations;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "posduif".to_string(),
            password: String::new(),
            database: "posduif".to_string(),
            max_connections: 25,
        }
    }
}

impl StoreConfig {
    fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }

    /// Conninfo string for the dedicated replication connection.
    ///
    /// `replication=database` switches the session into the logical
    /// replication sub-protocol; the pool never sets it, only the WAL
    /// reader's single connection does.
    pub fn replication_conninfo(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} replication=database",
            quote_conninfo(&self.host),
            self.port,
            quote_conninfo(&self.user),
            quote_conninfo(&self.password),
            quote_conninfo(&self.database),
        )
    }
}

/// Quote a libpq conninfo value: wrap in single quotes when it is empty or
/// contains spaces, escaping embedded quotes and backslashes.
fn quote_conninfo(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

/// Typed access to users, messages, enrollment tokens and sync metadata.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    config: StoreConfig,
}

impl Store {
    /// Connect, verify the connection, and run idempotent migrations.
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .max_lifetime(Duration::from_secs(30 * 60))
            .idle_timeout(Duration::from_secs(5 * 60))
            .connect_with(config.connect_options())
            .await?;

        tracing::info!(
            host = %config.host,
            database = %config.database,
            max_connections = config.max_connections,
            "connected to postgres"
        );

        migrations::run(&pool).await?;

        Ok(Self { pool, config })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The tenant database name.
    pub fn database_name(&self) -> &str {
        &self.config.database
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.port, 5432);
        assert_eq!(config.max_connections, 25);
    }

    #[test]
    fn replication_conninfo_sets_replication_mode() {
        let config = StoreConfig {
            database: "tenant-a".to_string(),
            ..StoreConfig::default()
        };
        let conninfo = config.replication_conninfo();
        assert!(conninfo.contains("replication=database"));
        assert!(conninfo.contains("dbname=tenant-a"));
    }

    #[test]
    fn conninfo_values_with_spaces_are_quoted() {
        assert_eq!(quote_conninfo("plain"), "plain");
        assert_eq!(quote_conninfo(""), "''");
        assert_eq!(quote_conninfo("pass word"), "'pass word'");
        assert_eq!(quote_conninfo("it's"), "'it\\'s'");
    }
}
