//! Browser-facing message endpoints (JWT-authenticated).

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use posduif_shared::wire::{CreateMessageRequest, MessageListResponse, UnreadCountResponse};
use posduif_shared::{Message, MessageStatus};
use posduif_store::MessageFilter;

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::error::ServerError;

pub async fn create(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<CreateMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let content = req.content.trim();
    if content.is_empty() {
        return Err(ServerError::Validation(
            "message content cannot be empty".to_string(),
        ));
    }

    state
        .store
        .user_by_id(req.recipient_id)
        .await?
        .ok_or_else(|| ServerError::NotFound("recipient not found".to_string()))?;

    let msg = state
        .store
        .create_message(&Message::new(user_id, req.recipient_id, content.to_string()))
        .await?;

    let unread = state.store.unread_count(req.recipient_id).await.unwrap_or(0);
    state
        .publisher
        .publish_new_message(msg.id, req.recipient_id, unread)
        .await;

    Ok((StatusCode::CREATED, Json(msg)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub status: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(params): Query<ListParams>,
) -> Result<Json<MessageListResponse>, ServerError> {
    let limit = params.limit.filter(|l| *l > 0).unwrap_or(50);
    let offset = params.offset.filter(|o| *o >= 0).unwrap_or(0);
    let status = match params.status.as_deref() {
        None => None,
        Some(s) => Some(
            MessageStatus::parse(s)
                .ok_or_else(|| ServerError::Validation(format!("unknown status {s:?}")))?,
        ),
    };

    let filter = MessageFilter {
        recipient_id: Some(user_id),
        status,
        limit: Some(limit),
        offset: Some(offset),
    };
    let messages = state.store.messages(&filter).await?;

    Ok(Json(MessageListResponse {
        total: messages.len(),
        messages,
        limit,
        offset,
    }))
}

pub async fn get(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Message>, ServerError> {
    let msg = state
        .store
        .message_by_id(id)
        .await?
        // Outsiders learn nothing about foreign messages, not even that
        // they exist.
        .filter(|m| m.sender_id == user_id || m.recipient_id == user_id)
        .ok_or_else(|| ServerError::NotFound("message not found".to_string()))?;

    Ok(Json(msg))
}

pub async fn mark_read(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .store
        .message_by_id(id)
        .await?
        .filter(|m| m.recipient_id == user_id)
        .ok_or_else(|| ServerError::NotFound("message not found".to_string()))?;

    state
        .store
        .update_message_status(id, MessageStatus::Read)
        .await?;

    state.publisher.publish_message_read(id).await;

    Ok(Json(serde_json::json!({ "id": id, "status": "read" })))
}

pub async fn unread_count(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<UnreadCountResponse>, ServerError> {
    let unread_count = state.store.unread_count(user_id).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}
