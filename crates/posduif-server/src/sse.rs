//! Push notifier: long-lived SSE streams that nudge clients to poll.
//!
//! The streams carry hints only; the authoritative transfer is always the
//! sync API (mobile) or the message endpoints (web). A dropped stream
//! costs nothing but latency.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::{self, StreamExt};
use serde_json::json;
use uuid::Uuid;

use posduif_store::Store;

use crate::api::AppState;
use crate::auth::{AuthUser, DeviceId};
use crate::error::ServerError;

/// How often the mobile stream checks for pending changes.
const MOBILE_POLL: Duration = Duration::from_secs(30);

/// How often the web stream refreshes the unread count.
const WEB_POLL: Duration = Duration::from_secs(5);

/// Pending-change ids sent per mobile nudge.
const MOBILE_NUDGE_LIMIT: i64 = 10;

/// `GET /sse/mobile/{device_id}` — requires `X-Device-ID` matching the path.
pub async fn mobile(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    DeviceId(header_device_id): DeviceId,
) -> Result<impl IntoResponse, ServerError> {
    if device_id != header_device_id {
        return Err(ServerError::Validation("device id mismatch".to_string()));
    }

    struct Poll {
        store: Arc<Store>,
        device_id: String,
        first: bool,
    }

    let poll = Poll {
        store: state.store.clone(),
        device_id,
        first: true,
    };

    let events = stream::unfold(poll, |mut poll| async move {
        if poll.first {
            poll.first = false;
            let connected = Event::default()
                .event("connected")
                .data(json!({ "device_id": poll.device_id }).to_string());
            return Some((vec![connected], poll));
        }

        tokio::time::sleep(MOBILE_POLL).await;
        let events = match poll
            .store
            .pending_messages_for_device(&poll.device_id, MOBILE_NUDGE_LIMIT)
            .await
        {
            Ok(messages) => messages
                .iter()
                .map(|msg| {
                    Event::default().event("message").data(
                        json!({ "type": "new_message", "message_id": msg.id }).to_string(),
                    )
                })
                .collect(),
            Err(e) => {
                tracing::warn!(device_id = %poll.device_id, error = %e, "mobile nudge poll failed");
                Vec::new()
            }
        };
        Some((events, poll))
    })
    .flat_map(stream::iter)
    .map(Ok::<_, Infallible>);

    Ok(Sse::new(events).keep_alive(keep_alive(&state)))
}

/// `GET /sse/web/{user_id}` — the JWT user must match the path.
pub async fn web(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    AuthUser(auth_user_id): AuthUser,
) -> Result<impl IntoResponse, ServerError> {
    if user_id != auth_user_id {
        return Err(ServerError::Unauthorized("user id mismatch".to_string()));
    }

    struct Poll {
        store: Arc<Store>,
        user_id: Uuid,
        first: bool,
    }

    let poll = Poll {
        store: state.store.clone(),
        user_id,
        first: true,
    };

    let events = stream::unfold(poll, |mut poll| async move {
        if poll.first {
            poll.first = false;
            let connected = Event::default()
                .event("connected")
                .data(json!({ "user_id": poll.user_id }).to_string());
            return Some((vec![connected], poll));
        }

        tokio::time::sleep(WEB_POLL).await;
        let events = match poll.store.unread_count(poll.user_id).await {
            Ok(count) if count > 0 => vec![Event::default().event("new_message").data(
                json!({ "type": "new_message", "unread_count": count }).to_string(),
            )],
            Ok(_) => Vec::new(),
            Err(e) => {
                tracing::warn!(user_id = %poll.user_id, error = %e, "web nudge poll failed");
                Vec::new()
            }
        };
        Some((events, poll))
    })
    .flat_map(stream::iter)
    .map(Ok::<_, Infallible>);

    Ok(Sse::new(events).keep_alive(keep_alive(&state)))
}

fn keep_alive(state: &AppState) -> KeepAlive {
    KeepAlive::new()
        .interval(state.config.sse.ping_interval())
        .text("ping")
}
