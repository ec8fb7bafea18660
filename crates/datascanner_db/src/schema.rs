//! All CREATE TABLE statements live here.

use crate::error::Result;
use crate::ScannerDb;
use tracing::debug;

const STATEMENTS: &[&str] = &[
    // Messages waiting on, or leased from, a queue.
    r#"CREATE TABLE IF NOT EXISTS queue_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        body TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        lease_until INTEGER,
        last_error TEXT,
        enqueued_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_queue_messages_ready ON queue_messages(queue, lease_until, id)",
    // Messages that were rejected for good.
    r#"CREATE TABLE IF NOT EXISTS dead_letters (
        id INTEGER PRIMARY KEY,
        queue TEXT NOT NULL,
        body TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        error TEXT,
        dead_at INTEGER NOT NULL
    )"#,
    // One verdict per (scan, handle); redelivery overwrites it.
    r#"CREATE TABLE IF NOT EXISTS report_matches (
        scan_tag TEXT NOT NULL,
        handle TEXT NOT NULL,
        matched INTEGER NOT NULL,
        body TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (scan_tag, handle)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS report_metadata (
        scan_tag TEXT NOT NULL,
        handle TEXT NOT NULL,
        metadata TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (scan_tag, handle)
    )"#,
    // An empty scan_tag or location stands for "none", so that the natural
    // key stays unique and a redelivered problem updates its row.
    r#"CREATE TABLE IF NOT EXISTS report_problems (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scan_tag TEXT NOT NULL DEFAULT '',
        location TEXT NOT NULL DEFAULT '',
        problem TEXT NOT NULL,
        body TEXT NOT NULL,
        recorded_at INTEGER NOT NULL,
        UNIQUE (scan_tag, location, problem)
    )"#,
];

impl ScannerDb {
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        // WAL lets stage processes read while another one writes.
        sqlx::query("PRAGMA journal_mode=WAL").execute(&self.pool).await?;
        sqlx::query("PRAGMA synchronous=NORMAL").execute(&self.pool).await?;
        sqlx::query("PRAGMA busy_timeout=5000").execute(&self.pool).await?;

        for statement in STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        debug!("Database schema verified");
        Ok(())
    }
}
