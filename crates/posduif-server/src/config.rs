//! YAML configuration with environment overrides.
//!
//! Defaults are applied through `serde(default)`; the environment can
//! override store credentials and the listen port, which is what container
//! deployments actually vary per instance.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use posduif_store::StoreConfig;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub redis: RedisConfig,
    pub sse: SseConfig,
    pub sync: SyncConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db: String,
    pub max_connections: u32,
    pub ssl_mode: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "posduif".to_string(),
            password: String::new(),
            db: "posduif".to_string(),
            max_connections: 25,
            ssl_mode: "disable".to_string(),
        }
    }
}

impl PostgresConfig {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.db.clone(),
            max_connections: self.max_connections,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: i64,
    pub streams: StreamsConfig,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: String::new(),
            db: 0,
            streams: StreamsConfig::default(),
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            )
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    pub enabled: bool,
    pub max_length: usize,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_length: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SseConfig {
    pub port: u16,
    pub read_timeout: String,
    pub write_timeout: String,
    pub ping_interval: String,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: "30s".to_string(),
            write_timeout: "30s".to_string(),
            ping_interval: "15s".to_string(),
        }
    }
}

impl SseConfig {
    pub fn ping_interval(&self) -> Duration {
        parse_duration(&self.ping_interval).unwrap_or(Duration::from_secs(15))
    }

    pub fn request_timeout(&self) -> Duration {
        parse_duration(&self.write_timeout).unwrap_or(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub compression: bool,
    pub compression_threshold: usize,
    pub conflict_resolution: String,
    pub retry_attempts: u32,
    pub retry_backoff: String,
    pub wal: WalConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            compression: false,
            compression_threshold: 1024,
            conflict_resolution: "last_write_wins".to_string(),
            retry_attempts: 3,
            retry_backoff: "1s".to_string(),
            wal: WalConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub enabled: bool,
    /// Explicit slot name; empty derives `posduif_sync_<db>`.
    pub slot_name: String,
    pub batch_size: usize,
    pub read_interval: String,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            slot_name: String::new(),
            batch_size: 100,
            read_interval: "1s".to_string(),
        }
    }
}

impl WalConfig {
    pub fn read_interval(&self) -> Duration {
        parse_duration(&self.read_interval).unwrap_or(Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// Token lifetime in seconds.
    pub jwt_expiration: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_expiration: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .map(String::from)
                .to_vec(),
            allowed_headers: ["Content-Type", "Authorization", "X-Device-ID"]
                .map(String::from)
                .to_vec(),
            max_age: 3600,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!("failed to read config {}: {e}", path.as_ref().display())
        })?;
        let mut config: Config = serde_yaml::from_str(&data)
            .map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("POSDUIF_POSTGRES_HOST") {
            self.postgres.host = host;
        }
        if let Ok(port) = std::env::var("POSDUIF_POSTGRES_PORT") {
            match port.parse() {
                Ok(port) => self.postgres.port = port,
                Err(_) => tracing::warn!(value = %port, "invalid POSDUIF_POSTGRES_PORT, ignored"),
            }
        }
        if let Ok(user) = std::env::var("POSDUIF_POSTGRES_USER") {
            self.postgres.user = user;
        }
        if let Ok(password) = std::env::var("POSDUIF_POSTGRES_PASSWORD") {
            self.postgres.password = password;
        }
        if let Ok(db) = std::env::var("POSDUIF_POSTGRES_DB") {
            self.postgres.db = db;
        }
        if let Ok(host) = std::env::var("POSDUIF_REDIS_HOST") {
            self.redis.host = host;
        }
        if let Ok(password) = std::env::var("POSDUIF_REDIS_PASSWORD") {
            self.redis.password = password;
        }
        if let Ok(port) = std::env::var("POSDUIF_PORT") {
            match port.parse() {
                Ok(port) => self.sse.port = port,
                Err(_) => tracing::warn!(value = %port, "invalid POSDUIF_PORT, ignored"),
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.auth.jwt_secret.is_empty() {
            anyhow::bail!("auth.jwt_secret must be set");
        }
        if self.sync.batch_size == 0 {
            anyhow::bail!("sync.batch_size must be positive");
        }
        Ok(())
    }
}

/// Parse durations in the `30s` / `500ms` / `5m` / `1h` form.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.postgres.port, 5432);
        assert_eq!(config.postgres.max_connections, 25);
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.sse.port, 8080);
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.sync.wal.batch_size, 100);
        assert_eq!(config.sync.wal.read_interval(), Duration::from_secs(1));
        assert_eq!(config.auth.jwt_expiration, 3600);
        assert!(!config.sync.wal.enabled);
    }

    #[test]
    fn parses_partial_yaml() {
        let yaml = r#"
postgres:
  host: db.internal
  db: tenant-a
sync:
  wal:
    enabled: true
    read_interval: 500ms
auth:
  jwt_secret: hunter2
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.postgres.host, "db.internal");
        assert_eq!(config.postgres.db, "tenant-a");
        // Untouched keys keep their defaults.
        assert_eq!(config.postgres.port, 5432);
        assert!(config.sync.wal.enabled);
        assert_eq!(
            config.sync.wal.read_interval(),
            Duration::from_millis(500)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_missing_jwt_secret() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("nope"), None);
        assert_eq!(parse_duration("10"), None);
    }

    #[test]
    fn redis_url_with_and_without_password() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://localhost:6379/0");
        redis.password = "geheim".to_string();
        assert_eq!(redis.url(), "redis://:geheim@localhost:6379/0");
    }
}
