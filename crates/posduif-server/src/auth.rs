//! Authentication boundary.
//!
//! Two independent schemes, never mixed: web endpoints require a JWT bearer
//! token ([`AuthUser`]); device endpoints require the `X-Device-ID` header
//! ([`DeviceId`]). Handlers declare which one they need as an extractor.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::ServerError;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

#[derive(Clone)]
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expiry_secs: i64,
}

impl AuthKeys {
    pub fn new(secret: &str, expiry_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expiry_secs,
        }
    }

    pub fn expiry_secs(&self) -> i64 {
        self.expiry_secs
    }

    pub fn issue(&self, user_id: Uuid) -> Result<String, ServerError> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: Utc::now().timestamp() + self.expiry_secs,
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ServerError::Internal(format!("failed to sign token: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<Uuid, ServerError> {
        let data =
            jsonwebtoken::decode::<Claims>(token, &self.decoding, &Validation::default())
                .map_err(|e| ServerError::Unauthorized(format!("invalid token: {e}")))?;
        Uuid::parse_str(&data.claims.sub)
            .map_err(|_| ServerError::Unauthorized("invalid token subject".to_string()))
    }
}

/// The authenticated web user, from `Authorization: Bearer <jwt>`.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ServerError::Unauthorized("missing bearer token".to_string()))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ServerError::Unauthorized("missing bearer token".to_string()))?;

        state.auth.verify(token).map(AuthUser)
    }
}

/// The calling device, from the `X-Device-ID` header. Missing or blank
/// is a 400, per the device API contract.
#[derive(Debug, Clone)]
pub struct DeviceId(pub String);

impl<S> FromRequestParts<S> for DeviceId
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let device_id = parts
            .headers
            .get("x-device-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();

        if device_id.is_empty() {
            return Err(ServerError::MissingDeviceId);
        }
        Ok(DeviceId(device_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_verify_round_trip() {
        let keys = AuthKeys::new("test-secret", 3600);
        let user = Uuid::new_v4();
        let token = keys.issue(user).unwrap();
        assert_eq!(keys.verify(&token).unwrap(), user);
    }

    #[test]
    fn rejects_token_signed_with_other_secret() {
        let keys = AuthKeys::new("secret-a", 3600);
        let other = AuthKeys::new("secret-b", 3600);
        let token = other.issue(Uuid::new_v4()).unwrap();
        assert!(keys.verify(&token).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let keys = AuthKeys::new("test-secret", -120);
        let token = keys.issue(Uuid::new_v4()).unwrap();
        assert!(keys.verify(&token).is_err());
    }

    #[test]
    fn rejects_garbage() {
        let keys = AuthKeys::new("test-secret", 3600);
        assert!(keys.verify("not-a-jwt").is_err());
    }
}
