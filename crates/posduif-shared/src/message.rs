use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery status of a message.
///
/// Statuses form a one-way chain `pending_sync -> synced -> read`; a message
/// never moves backwards. Re-applying the current status is allowed so that
/// redelivered sync batches stay idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    PendingSync,
    Synced,
    Read,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::PendingSync => "pending_sync",
            MessageStatus::Synced => "synced",
            MessageStatus::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_sync" => Some(MessageStatus::PendingSync),
            "synced" => Some(MessageStatus::Synced),
            "read" => Some(MessageStatus::Read),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `next` is allowed.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        self <= next
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-to-user message. Content is immutable after creation; only the
/// status (and its companion timestamps) ever changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// A fresh `pending_sync` message stamped with the current time.
    pub fn new(sender_id: Uuid, recipient_id: Uuid, content: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sender_id,
            recipient_id,
            content,
            status: MessageStatus::PendingSync,
            created_at: now,
            updated_at: now,
            synced_at: None,
            read_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_chain_is_monotonic() {
        use MessageStatus::*;

        assert!(PendingSync.can_advance_to(Synced));
        assert!(PendingSync.can_advance_to(Read));
        assert!(Synced.can_advance_to(Read));

        assert!(!Synced.can_advance_to(PendingSync));
        assert!(!Read.can_advance_to(Synced));
        assert!(!Read.can_advance_to(PendingSync));

        // Idempotent re-application.
        assert!(Synced.can_advance_to(Synced));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&MessageStatus::PendingSync).unwrap();
        assert_eq!(json, "\"pending_sync\"");
        let back: MessageStatus = serde_json::from_str("\"read\"").unwrap();
        assert_eq!(back, MessageStatus::Read);
    }

    #[test]
    fn status_parse_matches_as_str() {
        for status in [
            MessageStatus::PendingSync,
            MessageStatus::Synced,
            MessageStatus::Read,
        ] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse("bogus"), None);
    }

    #[test]
    fn new_message_defaults() {
        let msg = Message::new(Uuid::new_v4(), Uuid::new_v4(), "hi".into());
        assert_eq!(msg.status, MessageStatus::PendingSync);
        assert!(msg.synced_at.is_none());
        assert!(msg.read_at.is_none());
        assert_eq!(msg.created_at, msg.updated_at);
    }
}
