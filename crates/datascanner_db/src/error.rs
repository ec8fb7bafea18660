//! Error types for the queue and report store.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Sqlx(sqlx::Error::Database(db)) => {
                let message = db.message();
                message.contains("database is locked") || message.contains("busy")
            }
            DbError::Sqlx(sqlx::Error::PoolTimedOut) | DbError::Sqlx(sqlx::Error::Io(_)) => true,
            DbError::Io(_) => true,
            _ => false,
        }
    }
}
