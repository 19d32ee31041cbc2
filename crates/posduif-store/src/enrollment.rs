use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use posduif_shared::EnrollmentToken;

use crate::database::Store;
use crate::error::{Result, StoreError};

/// Enrollment tokens are single-use and live this long.
pub const TOKEN_TTL_HOURS: i64 = 1;

impl Store {
    /// Mint a one-shot enrollment token for a web user.
    pub async fn create_enrollment_token(
        &self,
        created_by: Uuid,
        tenant_id: &str,
    ) -> Result<EnrollmentToken> {
        let now = Utc::now();
        let token = EnrollmentToken {
            id: Uuid::new_v4(),
            token: Uuid::new_v4().to_string(),
            created_by,
            tenant_id: tenant_id.to_string(),
            expires_at: now + Duration::hours(TOKEN_TTL_HOURS),
            used_at: None,
            device_id: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO enrollment_tokens (id, token, created_by, tenant_id,
                                           expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(token.id)
        .bind(&token.token)
        .bind(token.created_by)
        .bind(&token.tenant_id)
        .bind(token.expires_at)
        .bind(token.created_at)
        .bind(token.updated_at)
        .execute(self.pool())
        .await?;

        Ok(token)
    }

    pub async fn enrollment_token(&self, token: &str) -> Result<Option<EnrollmentToken>> {
        let row = sqlx::query(
            r#"
            SELECT id, token, created_by, tenant_id, expires_at, used_at,
                   device_id, created_at, updated_at
              FROM enrollment_tokens
             WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_token).transpose()
    }

    /// Redeem a token and bind the device, in one transaction.
    ///
    /// The token is consumed only if it is unused and unexpired. The device
    /// then either refreshes an existing mobile user (same `device_id`) or a
    /// new mobile user is inserted; a username collision is resolved by
    /// taking over the colliding row's device binding.
    ///
    /// Returns the id of the enrolled user.
    pub async fn complete_enrollment(
        &self,
        token: &str,
        device_id: &str,
        username: &str,
    ) -> Result<Uuid> {
        let mut tx = self.pool().begin().await?;

        let consumed = sqlx::query(
            r#"
            UPDATE enrollment_tokens
               SET used_at = NOW(), device_id = $1, updated_at = NOW()
             WHERE token = $2 AND used_at IS NULL AND expires_at > NOW()
            "#,
        )
        .bind(device_id)
        .bind(token)
        .execute(&mut *tx)
        .await?;

        if consumed.rows_affected() == 0 {
            return Err(StoreError::TokenUsedOrExpired);
        }

        let token_id: Uuid =
            sqlx::query_scalar("SELECT id FROM enrollment_tokens WHERE token = $1")
                .bind(token)
                .fetch_one(&mut *tx)
                .await?;

        let existing: Option<Uuid> = sqlx::query_scalar("SELECT id FROM users WHERE device_id = $1")
            .bind(device_id)
            .fetch_optional(&mut *tx)
            .await?;

        let now = Utc::now();
        let user_id = match existing {
            Some(user_id) => {
                // Re-enrollment of a known device: refresh its identity.
                sqlx::query(
                    r#"
                    UPDATE users
                       SET username = $1, enrolled_at = $2, enrollment_token_id = $3,
                           updated_at = $2
                     WHERE id = $4
                    "#,
                )
                .bind(username)
                .bind(now)
                .bind(token_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if StoreError::is_unique_violation(&e) {
                        StoreError::Conflict(format!("username {username:?} already taken"))
                    } else {
                        e.into()
                    }
                })?;
                user_id
            }
            None => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO users (id, username, user_type, device_id,
                                       enrolled_at, enrollment_token_id, created_at, updated_at)
                    VALUES ($1, $2, 'mobile', $3, $4, $5, $6, $6)
                    ON CONFLICT (username) DO UPDATE
                       SET device_id = EXCLUDED.device_id,
                           user_type = EXCLUDED.user_type,
                           enrolled_at = EXCLUDED.enrolled_at,
                           enrollment_token_id = EXCLUDED.enrollment_token_id,
                           updated_at = EXCLUDED.updated_at
                    RETURNING id
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(username)
                .bind(device_id)
                .bind(now)
                .bind(token_id)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;

        tracing::info!(user_id = %user_id, device_id = %device_id, "enrollment completed");
        Ok(user_id)
    }
}

fn row_to_token(row: &PgRow) -> Result<EnrollmentToken> {
    Ok(EnrollmentToken {
        id: row.try_get("id")?,
        token: row.try_get("token")?,
        created_by: row.try_get("created_by")?,
        tenant_id: row.try_get("tenant_id")?,
        expires_at: row.try_get::<DateTime<Utc>, _>("expires_at")?,
        used_at: row.try_get("used_at")?,
        device_id: row.try_get("device_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
