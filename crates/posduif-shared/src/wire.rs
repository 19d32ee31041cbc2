//! Request and response bodies for the HTTP API.
//!
//! Everything here is plain serde data; handlers own the HTTP mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::message::{Message, MessageStatus};
use crate::user::User;

// ─── Device sync ───

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncIncomingResponse {
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<User>>,
    pub compressed: bool,
    pub sync_timestamp: DateTime<Utc>,
}

/// One uploaded message. The device normally supplies the id (that is the
/// retry/dedup key); a missing id gets a fresh one server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl OutgoingMessage {
    /// Fill in server-side defaults and produce a storable message.
    pub fn into_message(self) -> Message {
        let now = Utc::now();
        Message {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            content: self.content,
            status: self.status.unwrap_or(MessageStatus::PendingSync),
            created_at: self.created_at.unwrap_or(now),
            updated_at: now,
            synced_at: None,
            read_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutgoingRequest {
    pub messages: Vec<OutgoingMessage>,
    #[serde(default)]
    pub compressed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedMessage {
    pub message_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutgoingResponse {
    pub synced_count: usize,
    pub failed_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_messages: Option<Vec<FailedMessage>>,
    pub sync_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusResponse {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub pending_outgoing_count: i32,
    pub sync_status: crate::sync::SyncState,
}

// ─── Web messages ───

#[derive(Debug, Clone, Deserialize)]
pub struct CreateMessageRequest {
    pub recipient_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageListResponse {
    pub messages: Vec<Message>,
    pub total: usize,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub unread_count: i64,
}

// ─── Enrollment ───

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentResponse {
    pub token: String,
    pub qr_code_data: Value,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentDetails {
    pub token: String,
    pub tenant_id: String,
    pub created_by: Uuid,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    pub valid: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteEnrollmentRequest {
    pub token: String,
    pub device_id: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentResult {
    pub user_id: Uuid,
    pub device_id: String,
    pub tenant_id: String,
}

// ─── Auth ───

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
    pub expires_in: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_message_defaults() {
        let json = r#"{
            "sender_id": "6a1f2c9e-58a1-4a7f-9b1f-0f2f9f0e8a11",
            "recipient_id": "7b2e3d0f-69b2-4b80-8c20-1a3a0a1f9b22",
            "content": "hello"
        }"#;
        let out: OutgoingMessage = serde_json::from_str(json).unwrap();
        assert!(out.id.is_none());
        let msg = out.into_message();
        assert_eq!(msg.status, MessageStatus::PendingSync);
        assert_eq!(msg.content, "hello");
    }

    #[test]
    fn outgoing_message_keeps_client_id() {
        let id = Uuid::new_v4();
        let out = OutgoingMessage {
            id: Some(id),
            sender_id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            content: "x".into(),
            status: None,
            created_at: None,
        };
        assert_eq!(out.into_message().id, id);
    }

    #[test]
    fn incoming_response_omits_absent_roster() {
        let resp = SyncIncomingResponse {
            messages: vec![],
            users: None,
            compressed: false,
            sync_timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("users").is_none());
        assert_eq!(json["compressed"], false);
    }

    #[test]
    fn failed_messages_omitted_when_none() {
        let resp = SyncOutgoingResponse {
            synced_count: 3,
            failed_count: 0,
            failed_messages: None,
            sync_timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("failed_messages").is_none());
    }
}
