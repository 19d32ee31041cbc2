//! Best-effort event publishing to Redis streams.
//!
//! Events are side notifications only; nothing in the sync protocol depends
//! on them. Publish failures are logged and swallowed, never surfaced to
//! the request that triggered them.

use chrono::Utc;
use redis::aio::ConnectionManager;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::RedisConfig;

pub const EVENT_NEW_MESSAGE: &str = "new_message";
pub const EVENT_MESSAGE_READ: &str = "message_read";

#[derive(Clone)]
pub struct Publisher {
    conn: Option<ConnectionManager>,
    max_length: usize,
}

impl Publisher {
    /// Connect if streams are enabled; a disabled publisher swallows all
    /// publishes.
    pub async fn connect(config: &RedisConfig) -> anyhow::Result<Self> {
        if !config.streams.enabled {
            tracing::info!("redis streams disabled; events will not be published");
            return Ok(Self {
                conn: None,
                max_length: config.streams.max_length,
            });
        }

        let client = redis::Client::open(config.url())
            .map_err(|e| anyhow::anyhow!("invalid redis config: {e}"))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow::anyhow!("failed to connect to redis: {e}"))?;

        tracing::info!(host = %config.host, port = config.port, "connected to redis");
        Ok(Self {
            conn: Some(conn),
            max_length: config.streams.max_length,
        })
    }

    pub async fn publish_new_message(
        &self,
        message_id: Uuid,
        recipient_id: Uuid,
        unread_count: i64,
    ) {
        self.publish(
            EVENT_NEW_MESSAGE,
            json!({
                "message_id": message_id,
                "recipient_id": recipient_id,
                "unread_count": unread_count,
                "timestamp": Utc::now().timestamp(),
            }),
        )
        .await;
    }

    pub async fn publish_message_read(&self, message_id: Uuid) {
        self.publish(
            EVENT_MESSAGE_READ,
            json!({
                "message_id": message_id,
                "timestamp": Utc::now().timestamp(),
            }),
        )
        .await;
    }

    /// `XADD events:<type> MAXLEN ~ <n> * event <json>`; oldest entries are
    /// evicted once the stream passes its cap.
    async fn publish(&self, event_type: &str, data: Value) {
        let Some(conn) = &self.conn else {
            return;
        };

        let event = json!({
            "type": event_type,
            "timestamp": Utc::now().timestamp(),
            "data": data,
        });
        let stream = format!("events:{event_type}");

        let mut conn = conn.clone();
        let result: redis::RedisResult<String> = redis::cmd("XADD")
            .arg(&stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg("event")
            .arg(event.to_string())
            .query_async(&mut conn)
            .await;

        match result {
            Ok(id) => tracing::debug!(stream = %stream, id = %id, "published event"),
            Err(e) => tracing::warn!(stream = %stream, error = %e, "failed to publish event"),
        }
    }
}
