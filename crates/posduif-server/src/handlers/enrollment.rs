//! Device enrollment: token mint (web), token inspect and redemption
//! (public; the phone holds only the token at that point).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use posduif_shared::wire::{
    CompleteEnrollmentRequest, EnrollmentDetails, EnrollmentResponse, EnrollmentResult,
};

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::error::ServerError;

pub async fn create(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<(StatusCode, Json<EnrollmentResponse>), ServerError> {
    let tenant_id = state.store.database_name().to_string();
    let token = state
        .store
        .create_enrollment_token(user_id, &tenant_id)
        .await?;

    let enrollment_url = format!(
        "http://localhost:{}/api/enrollment/{}",
        state.config.sse.port, token.token
    );

    tracing::info!(created_by = %user_id, expires_at = %token.expires_at, "enrollment token minted");

    Ok((
        StatusCode::CREATED,
        Json(EnrollmentResponse {
            token: token.token.clone(),
            qr_code_data: json!({
                "enrollment_url": enrollment_url,
                "token": token.token,
                "tenant_id": token.tenant_id,
            }),
            expires_at: token.expires_at,
        }),
    ))
}

pub async fn details(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<EnrollmentDetails>, ServerError> {
    let stored = state
        .store
        .enrollment_token(&token)
        .await?
        .ok_or_else(|| ServerError::NotFound("enrollment token not found".to_string()))?;

    let valid = stored.is_valid(Utc::now());
    if !valid {
        return Err(ServerError::Validation(
            "enrollment token expired or already used".to_string(),
        ));
    }

    Ok(Json(EnrollmentDetails {
        token: stored.token,
        tenant_id: stored.tenant_id,
        created_by: stored.created_by,
        expires_at: stored.expires_at,
        used_at: stored.used_at,
        valid,
    }))
}

pub async fn complete(
    State(state): State<AppState>,
    Json(req): Json<CompleteEnrollmentRequest>,
) -> Result<Json<EnrollmentResult>, ServerError> {
    if req.device_id.trim().is_empty() {
        return Err(ServerError::Validation("device_id required".to_string()));
    }
    if req.username.trim().is_empty() {
        return Err(ServerError::Validation("username required".to_string()));
    }

    let token = state
        .store
        .enrollment_token(&req.token)
        .await?
        .ok_or_else(|| ServerError::NotFound("enrollment token not found".to_string()))?;

    let user_id = state
        .store
        .complete_enrollment(&req.token, req.device_id.trim(), req.username.trim())
        .await?;

    Ok(Json(EnrollmentResult {
        user_id,
        device_id: req.device_id.trim().to_string(),
        tenant_id: token.tenant_id,
    }))
}
