//! Report store written by the exporter.
//!
//! Matches and metadata are keyed by (scan tag, handle), so a redelivered
//! message replaces the row it already produced instead of adding one.

use crate::error::Result;
use crate::types::{MatchRecord, MetadataRecord, ProblemRecord};
use crate::ScannerDb;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

impl ScannerDb {
    // ========================================================================
    // Matches
    // ========================================================================

    pub async fn upsert_match(&self, scan_tag: &str, handle: &str, matched: bool, body: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO report_matches (scan_tag, handle, matched, body, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(scan_tag, handle) DO UPDATE SET
                matched = excluded.matched,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(scan_tag)
        .bind(handle)
        .bind(matched)
        .bind(serde_json::to_string(body)?)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Matches of one scan, oldest first. With `only_matched`, Handles
    /// that were checked and found clean are left out.
    pub async fn list_matches(&self, scan_tag: &str, only_matched: bool) -> Result<Vec<MatchRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM report_matches
            WHERE scan_tag = ? AND (matched = 1 OR ? = 0)
            ORDER BY updated_at, handle
            "#,
        )
        .bind(scan_tag)
        .bind(only_matched)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_match).collect()
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    pub async fn upsert_metadata(&self, scan_tag: &str, handle: &str, metadata: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO report_metadata (scan_tag, handle, metadata, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(scan_tag, handle) DO UPDATE SET
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(scan_tag)
        .bind(handle)
        .bind(serde_json::to_string(metadata)?)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_metadata(&self, scan_tag: &str, handle: &str) -> Result<Option<MetadataRecord>> {
        let row = sqlx::query("SELECT * FROM report_metadata WHERE scan_tag = ? AND handle = ?")
            .bind(scan_tag)
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_metadata).transpose()
    }

    // ========================================================================
    // Problems
    // ========================================================================

    /// Records a problem, or refreshes the one already recorded for the
    /// same scan, location and kind. Returns the row id.
    pub async fn record_problem(
        &self,
        scan_tag: Option<&str>,
        location: Option<&Value>,
        problem: &str,
        body: &Value,
    ) -> Result<i64> {
        let location = location.map(serde_json::to_string).transpose()?;
        let row = sqlx::query(
            r#"
            INSERT INTO report_problems (scan_tag, location, problem, body, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (scan_tag, location, problem) DO UPDATE SET
                body = excluded.body,
                recorded_at = excluded.recorded_at
            RETURNING id
            "#,
        )
        .bind(scan_tag.unwrap_or(""))
        .bind(location.unwrap_or_default())
        .bind(problem)
        .bind(serde_json::to_string(body)?)
        .bind(Self::now_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    pub async fn list_problems(&self, scan_tag: Option<&str>) -> Result<Vec<ProblemRecord>> {
        let rows = match scan_tag {
            Some(tag) => {
                sqlx::query("SELECT * FROM report_problems WHERE scan_tag = ? ORDER BY id")
                    .bind(tag)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM report_problems ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_problem).collect()
    }
}

fn row_to_match(row: &SqliteRow) -> Result<MatchRecord> {
    Ok(MatchRecord {
        scan_tag: row.get("scan_tag"),
        handle: row.get("handle"),
        matched: row.get("matched"),
        body: serde_json::from_str(row.get::<&str, _>("body"))?,
        updated_at: ScannerDb::millis_to_datetime(row.get("updated_at")),
    })
}

fn row_to_metadata(row: &SqliteRow) -> Result<MetadataRecord> {
    Ok(MetadataRecord {
        scan_tag: row.get("scan_tag"),
        handle: row.get("handle"),
        metadata: serde_json::from_str(row.get::<&str, _>("metadata"))?,
        updated_at: ScannerDb::millis_to_datetime(row.get("updated_at")),
    })
}

fn row_to_problem(row: &SqliteRow) -> Result<ProblemRecord> {
    let scan_tag: String = row.get("scan_tag");
    let location: String = row.get("location");
    Ok(ProblemRecord {
        id: row.get("id"),
        scan_tag: (!scan_tag.is_empty()).then_some(scan_tag),
        location: if location.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&location)?)
        },
        problem: row.get("problem"),
        body: serde_json::from_str(row.get::<&str, _>("body"))?,
        recorded_at: ScannerDb::millis_to_datetime(row.get("recorded_at")),
    })
}
