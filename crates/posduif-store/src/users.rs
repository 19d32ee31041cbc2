use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{QueryBuilder, Row};
use uuid::Uuid;

use posduif_shared::user::UserFilter;
use posduif_shared::{User, UserType};

use crate::database::Store;
use crate::error::{Result, StoreError};

const USER_COLUMNS: &str = "id, username, user_type, device_id, online_status, last_seen, \
     enrolled_at, enrollment_token_id, last_message_sent, created_at, updated_at";

impl Store {
    pub async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    pub async fn user_by_device_id(&self, device_id: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE device_id = $1"
        ))
        .bind(device_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    /// List users ordered online-first, then by username.
    pub async fn list_users(&self, filter: &UserFilter) -> Result<Vec<User>> {
        let mut query = QueryBuilder::new(format!("SELECT {USER_COLUMNS} FROM users WHERE 1=1"));

        if let Some(exclude) = filter.exclude_user_id {
            query.push(" AND id != ");
            query.push_bind(exclude);
        }
        if let Some(ref needle) = filter.username_contains {
            query.push(" AND username ILIKE ");
            query.push_bind(format!("%{needle}%"));
        }
        if let Some(online) = filter.online_status {
            query.push(" AND online_status = ");
            query.push_bind(online);
        }
        query.push(" ORDER BY online_status DESC, username ASC");

        let rows = query.build().fetch_all(self.pool()).await?;
        rows.iter().map(row_to_user).collect()
    }

    pub async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, user_type, device_id, online_status,
                               enrolled_at, enrollment_token_id, last_message_sent,
                               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(user.user_type.as_str())
        .bind(&user.device_id)
        .bind(user.online_status)
        .bind(user.enrolled_at)
        .bind(user.enrollment_token_id)
        .bind(&user.last_message_sent)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(self.pool())
        .await
        .map_err(|e| {
            if StoreError::is_unique_violation(&e) {
                StoreError::Conflict(format!("username or device already taken: {e}"))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    pub async fn update_user(&self, user: &User) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
               SET username = $2, user_type = $3, device_id = $4, online_status = $5,
                   last_seen = $6, enrolled_at = $7, enrollment_token_id = $8,
                   last_message_sent = $9, updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(user.user_type.as_str())
        .bind(&user.device_id)
        .bind(user.online_status)
        .bind(user.last_seen)
        .bind(user.enrolled_at)
        .bind(user.enrollment_token_id)
        .bind(&user.last_message_sent)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Record the sender's most recent message content on the user row.
    pub async fn touch_last_message_sent(&self, user_id: Uuid, content: &str) -> Result<()> {
        sqlx::query("UPDATE users SET last_message_sent = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(content)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

pub(crate) fn row_to_user(row: &PgRow) -> Result<User> {
    let user_type: String = row.try_get("user_type")?;
    let user_type = UserType::parse(&user_type)
        .ok_or_else(|| StoreError::Decode(format!("unknown user_type {user_type:?}")))?;

    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        user_type,
        device_id: row.try_get("device_id")?,
        online_status: row.try_get("online_status")?,
        last_seen: row.try_get("last_seen")?,
        enrolled_at: row.try_get("enrolled_at")?,
        enrollment_token_id: row.try_get("enrollment_token_id")?,
        last_message_sent: row.try_get("last_message_sent")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// A brand-new web user created on first login.
pub fn new_web_user(username: &str) -> User {
    let now = Utc::now();
    User {
        id: Uuid::new_v4(),
        username: username.to_string(),
        user_type: UserType::Web,
        device_id: None,
        online_status: false,
        last_seen: None,
        enrolled_at: None,
        enrollment_token_id: None,
        last_message_sent: None,
        created_at: now,
        updated_at: now,
    }
}
