//! Web login, issuing a JWT bearer token.

use axum::extract::State;
use axum::Json;

use posduif_shared::wire::{LoginRequest, LoginResponse};

use crate::api::AppState;
use crate::error::ServerError;

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ServerError> {
    if req.username.trim().is_empty() {
        return Err(ServerError::Validation("username required".to_string()));
    }

    let user = state
        .store
        .user_by_username(req.username.trim())
        .await?
        .ok_or_else(|| ServerError::Unauthorized("invalid credentials".to_string()))?;

    let token = state.auth.issue(user.id)?;

    tracing::info!(user_id = %user.id, "web login");

    Ok(Json(LoginResponse {
        token,
        user,
        expires_in: state.auth.expiry_secs(),
    }))
}
