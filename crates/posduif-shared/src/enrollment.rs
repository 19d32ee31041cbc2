use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A one-shot device enrollment token.
///
/// Issued by a web user, expires by wall clock, and becomes unusable once
/// `used_at` is set. Redeeming it with a `device_id` turns it into a mobile
/// user bound to that device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrollmentToken {
    pub id: Uuid,
    pub token: String,
    pub created_by: Uuid,
    pub tenant_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnrollmentToken {
    /// Usable: not yet redeemed and not past its expiry.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && now < self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(expires_in: Duration, used: bool) -> EnrollmentToken {
        let now = Utc::now();
        EnrollmentToken {
            id: Uuid::new_v4(),
            token: Uuid::new_v4().to_string(),
            created_by: Uuid::new_v4(),
            tenant_id: "tenant-a".into(),
            expires_at: now + expires_in,
            used_at: used.then_some(now),
            device_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn fresh_token_is_valid() {
        assert!(token(Duration::hours(1), false).is_valid(Utc::now()));
    }

    #[test]
    fn used_token_is_invalid() {
        assert!(!token(Duration::hours(1), true).is_valid(Utc::now()));
    }

    #[test]
    fn expired_token_is_invalid() {
        assert!(!token(Duration::seconds(-1), false).is_valid(Utc::now()));
    }
}
