use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Web,
    Mobile,
}

impl UserType {
    pub fn as_str(self) -> &'static str {
        match self {
            UserType::Web => "web",
            UserType::Mobile => "mobile",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "web" => Some(UserType::Web),
            "mobile" => Some(UserType::Mobile),
            _ => None,
        }
    }
}

/// An account, either a browser user or an enrolled mobile device.
///
/// A mobile user carries exactly one `device_id`; a web user carries none.
/// `username` and `device_id` are each globally unique when set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub user_type: UserType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub online_status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrolled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrollment_token_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_sent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filter for user listings.
#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    /// Case-insensitive username substring.
    pub username_contains: Option<String>,
    pub online_status: Option<bool>,
    pub exclude_user_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_type_round_trip() {
        assert_eq!(UserType::parse("web"), Some(UserType::Web));
        assert_eq!(UserType::parse("mobile"), Some(UserType::Mobile));
        assert_eq!(UserType::parse("desktop"), None);
        assert_eq!(UserType::Mobile.as_str(), "mobile");
    }

    #[test]
    fn device_id_omitted_for_web_users() {
        let user = User {
            id: Uuid::new_v4(),
            username: "wilna".into(),
            user_type: UserType::Web,
            device_id: None,
            online_status: false,
            last_seen: None,
            enrolled_at: None,
            enrollment_token_id: None,
            last_message_sent: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("device_id").is_none());
        assert_eq!(json["user_type"], "web");
    }
}
