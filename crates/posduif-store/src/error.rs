use posduif_shared::MessageStatus;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record not found")]
    NotFound,

    #[error("message content cannot be empty")]
    EmptyContent,

    #[error("message {0} already exists with different content")]
    DuplicateMessage(Uuid),

    #[error("status cannot move from {from} to {to}")]
    StatusRegression {
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("enrollment token not found, already used, or expired")]
    TokenUsedOrExpired,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("corrupt row: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether this error means the store itself is unreachable (as opposed
    /// to a query-level failure). Handlers map this to 503.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Database(
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            )
        )
    }

    /// Whether the underlying driver error is a unique-constraint violation.
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
            _ => false,
        }
    }

    /// Whether the underlying driver error is a foreign-key violation.
    pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => db.code().as_deref() == Some("23503"),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
