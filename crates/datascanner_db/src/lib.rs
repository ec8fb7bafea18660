//! Durable storage for the datascanner pipeline
//!
//! One SQLite database holds both the message queues that connect the
//! stages and the report tables the exporter writes to.
//!
//! # Usage
//!
//! ```rust,ignore
//! use datascanner_db::ScannerDb;
//! use std::time::Duration;
//!
//! let db = ScannerDb::open("~/.datascanner/datascanner.sqlite3").await?;
//!
//! let id = db.enqueue("os2ds_sources", &body).await?;
//! if let Some(message) = db.claim(&["os2ds_sources"], Duration::from_secs(300)).await? {
//!     // ... work ...
//!     db.ack(message.id).await?;
//! }
//! ```

mod error;
mod queue;
mod reports;
mod schema;
mod types;

pub use error::{DbError, Result};
pub use types::*;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

/// Handle on the queue and report database. Cheap to clone.
#[derive(Clone)]
pub struct ScannerDb {
    pool: SqlitePool,
}

impl ScannerDb {
    /// Open or create a database at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;

        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// The underlying pool, for queries this crate does not wrap.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Current time as milliseconds since the Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(chrono::Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_database() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("nested").join("scanner.db");

        let db = ScannerDb::open(&db_path).await.unwrap();
        assert!(db_path.exists());
        db.close().await;

        // Reopening finds the schema in place.
        let db = ScannerDb::open(&db_path).await.unwrap();
        assert_eq!(db.pending("os2ds_sources").await.unwrap(), 0);
    }
}
