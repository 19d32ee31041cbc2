use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use posduif_store::StoreError;
use posduif_sync::SyncError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("X-Device-ID header required")]
    MissingDeviceId,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ServerError::MissingDeviceId | ServerError::Validation(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::Store(e) => store_status(e),
            ServerError::Sync(SyncError::Store(e)) => store_status(e),
            ServerError::Sync(_) | ServerError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            ),
        }
    }
}

fn store_status(e: &StoreError) -> (StatusCode, String) {
    match e {
        StoreError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
        StoreError::EmptyContent => (StatusCode::BAD_REQUEST, e.to_string()),
        StoreError::TokenUsedOrExpired => (StatusCode::BAD_REQUEST, e.to_string()),
        StoreError::DuplicateMessage(_)
        | StoreError::StatusRegression { .. }
        | StoreError::Conflict(_) => (StatusCode::CONFLICT, e.to_string()),
        _ if e.is_unavailable() => (
            StatusCode::SERVICE_UNAVAILABLE,
            "store unavailable".to_string(),
        ),
        // Driver details stay out of response bodies.
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal server error".to_string(),
        ),
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();

        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "request failed");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use posduif_shared::MessageStatus;

    #[test]
    fn maps_domain_errors_to_status_codes() {
        let cases: Vec<(ServerError, StatusCode)> = vec![
            (ServerError::MissingDeviceId, StatusCode::BAD_REQUEST),
            (
                ServerError::Unauthorized("no token".into()),
                StatusCode::UNAUTHORIZED,
            ),
            (
                ServerError::NotFound("user".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                ServerError::Conflict("duplicate".into()),
                StatusCode::CONFLICT,
            ),
            (
                ServerError::Store(StoreError::TokenUsedOrExpired),
                StatusCode::BAD_REQUEST,
            ),
            (
                ServerError::Store(StoreError::EmptyContent),
                StatusCode::BAD_REQUEST,
            ),
            (
                ServerError::Store(StoreError::NotFound),
                StatusCode::NOT_FOUND,
            ),
            (
                ServerError::Store(StoreError::StatusRegression {
                    from: MessageStatus::Read,
                    to: MessageStatus::Synced,
                }),
                StatusCode::CONFLICT,
            ),
            (
                ServerError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            let (status, _) = error.status_and_message();
            assert_eq!(status, expected, "for {error:?}");
        }
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let error = ServerError::Internal("secret connection string".into());
        let (_, message) = error.status_and_message();
        assert_eq!(message, "internal server error");
    }
}
