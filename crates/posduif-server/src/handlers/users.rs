//! User listing and lookup.
//!
//! These endpoints serve both audiences: enrolled devices (via
//! `X-Device-ID`, used to render the roster in the mobile app) and web
//! users (via JWT). Either credential is accepted; neither means 401.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use posduif_shared::user::UserFilter;
use posduif_shared::User;

use crate::api::AppState;
use crate::error::ServerError;

enum Caller {
    Device,
    Web(Uuid),
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Caller, ServerError> {
    let device_id = headers
        .get("x-device-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if device_id.is_some() {
        return Ok(Caller::Device);
    }

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ServerError::Unauthorized("missing credentials".to_string()))?;
    Ok(Caller::Web(state.auth.verify(token)?))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// Username substring filter.
    pub filter: Option<String>,
    /// `online` / `offline`.
    pub status: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<User>>, ServerError> {
    let caller = authenticate(&state, &headers)?;

    let online_status = match params.status.as_deref() {
        None | Some("") => None,
        Some("online" | "true") => Some(true),
        Some("offline" | "false") => Some(false),
        Some(other) => {
            return Err(ServerError::Validation(format!(
                "unknown status filter {other:?}"
            )))
        }
    };

    let filter = UserFilter {
        username_contains: params.filter.filter(|f| !f.is_empty()),
        online_status,
        exclude_user_id: match caller {
            Caller::Web(user_id) => Some(user_id),
            Caller::Device => None,
        },
    };

    let users = state.store.list_users(&filter).await?;
    Ok(Json(users))
}

pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<User>, ServerError> {
    authenticate(&state, &headers)?;

    let user = state
        .store
        .user_by_id(id)
        .await?
        .ok_or_else(|| ServerError::NotFound("user not found".to_string()))?;
    Ok(Json(user))
}
