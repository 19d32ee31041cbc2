//! The device sync API: incoming pull, outgoing upload, status read.
//!
//! All three require `X-Device-ID`. Responses are always JSON; the outgoing
//! upload reports per-item results with a 200 even when items fail, so
//! clients retry only the failing subset.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use posduif_shared::user::UserFilter;
use posduif_shared::wire::{
    SyncIncomingResponse, SyncOutgoingRequest, SyncOutgoingResponse, SyncStatusResponse,
};

use crate::api::AppState;
use crate::auth::DeviceId;
use crate::compression;
use crate::error::ServerError;

#[derive(Debug, Deserialize)]
pub struct IncomingParams {
    pub limit: Option<usize>,
    #[serde(default)]
    pub include_users: bool,
}

pub async fn incoming(
    State(state): State<AppState>,
    DeviceId(device_id): DeviceId,
    Query(params): Query<IncomingParams>,
) -> Result<Response, ServerError> {
    let cap = state.config.sync.batch_size;
    let limit = params.limit.unwrap_or(cap).clamp(1, cap);

    let messages = state.manager.sync_incoming(&device_id, limit).await?;

    // Roster refresh is opt-in; a roster failure never fails the sync.
    let users = if params.include_users {
        match state.store.list_users(&UserFilter::default()).await {
            Ok(users) => Some(users),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load user roster for sync");
                Some(Vec::new())
            }
        }
    } else {
        None
    };

    tracing::debug!(
        device_id = %device_id,
        count = messages.len(),
        "incoming sync served"
    );

    let response = SyncIncomingResponse {
        messages,
        users,
        compressed: false,
        sync_timestamp: Utc::now(),
    };

    // Large batches go out gzipped at the transport layer; the JSON shape
    // is identical either way.
    if state.config.sync.compression {
        let body = serde_json::to_vec(&response)
            .map_err(|e| ServerError::Internal(format!("failed to encode response: {e}")))?;
        if compression::should_compress(body.len(), state.config.sync.compression_threshold) {
            let gzipped = compression::compress(&body)?;
            return Ok((
                [
                    (header::CONTENT_TYPE, "application/json"),
                    (header::CONTENT_ENCODING, "gzip"),
                ],
                gzipped,
            )
                .into_response());
        }
    }

    Ok(Json(response).into_response())
}

pub async fn outgoing(
    State(state): State<AppState>,
    DeviceId(device_id): DeviceId,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SyncOutgoingResponse>, ServerError> {
    let body = if is_gzip(&headers) {
        compression::decompress(&body)?
    } else {
        body.to_vec()
    };

    let request: SyncOutgoingRequest = serde_json::from_slice(&body)
        .map_err(|e| ServerError::Validation(format!("invalid request body: {e}")))?;

    let messages = request
        .messages
        .into_iter()
        .map(|m| m.into_message())
        .collect();
    let summary = state.manager.sync_outgoing(messages).await;

    for stored in &summary.stored {
        if let Err(e) = state
            .store
            .touch_last_message_sent(stored.sender_id, &stored.content)
            .await
        {
            tracing::warn!(sender = %stored.sender_id, error = %e, "failed to record last message");
        }
    }

    tracing::info!(
        device_id = %device_id,
        synced = summary.synced_count,
        failed = summary.failed_count,
        "outgoing sync processed"
    );

    Ok(Json(SyncOutgoingResponse {
        synced_count: summary.synced_count,
        failed_count: summary.failed_count,
        failed_messages: (!summary.failed_messages.is_empty()).then_some(summary.failed_messages),
        sync_timestamp: Utc::now(),
    }))
}

pub async fn status(
    State(state): State<AppState>,
    DeviceId(device_id): DeviceId,
) -> Result<Json<SyncStatusResponse>, ServerError> {
    let meta = state.manager.sync_status(&device_id).await?;

    Ok(Json(SyncStatusResponse {
        device_id: meta.device_id,
        last_sync_timestamp: meta.last_sync_timestamp,
        pending_outgoing_count: meta.pending_outgoing_count,
        sync_status: meta.sync_status,
    }))
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_gzip_content_encoding() {
        let mut headers = HeaderMap::new();
        assert!(!is_gzip(&headers));
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        assert!(is_gzip(&headers));
        headers.insert(header::CONTENT_ENCODING, "GZIP".parse().unwrap());
        assert!(is_gzip(&headers));
        headers.insert(header::CONTENT_ENCODING, "br".parse().unwrap());
        assert!(!is_gzip(&headers));
    }
}
