//! Durable message queues with leases.
//!
//! A claim hides a message for the length of its lease. Acknowledging
//! deletes it; rejecting either makes it visible again or moves it to
//! `dead_letters`. A consumer that dies simply lets its lease expire, so
//! delivery is at least once.

use crate::error::{DbError, Result};
use crate::types::{DeadLetter, QueueDepth, QueuedMessage, RejectOutcome};
use crate::ScannerDb;
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, warn};

impl ScannerDb {
    // ========================================================================
    // Publishing and claiming
    // ========================================================================

    /// Append a message to `queue`.
    pub async fn enqueue(&self, queue: &str, body: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO queue_messages (queue, body, enqueued_at) VALUES (?, ?, ?)",
        )
        .bind(queue)
        .bind(body)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Claim the oldest visible message from any of `queues` (atomic claim).
    pub async fn claim(&self, queues: &[&str], lease: Duration) -> Result<Option<QueuedMessage>> {
        if queues.is_empty() {
            return Ok(None);
        }
        let now = Self::now_millis();
        let placeholders = vec!["?"; queues.len()].join(", ");
        let select = format!(
            r#"
            SELECT id, queue, body, attempts FROM queue_messages
            WHERE queue IN ({}) AND (lease_until IS NULL OR lease_until <= ?)
            ORDER BY id ASC
            LIMIT 1
            "#,
            placeholders
        );

        let mut tx = self.pool.begin().await?;

        let mut query = sqlx::query(&select);
        for queue in queues {
            query = query.bind(*queue);
        }
        let row = query.bind(now).fetch_optional(&mut *tx).await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let message = QueuedMessage {
            id: row.get("id"),
            queue: row.get("queue"),
            body: row.get("body"),
            attempts: row.get::<i64, _>("attempts") as u32,
        };

        // Guarded so that a competing claimer that got there first wins.
        let lease_until = now + lease.as_millis() as i64;
        let claimed = sqlx::query(
            r#"
            UPDATE queue_messages SET lease_until = ?
            WHERE id = ? AND (lease_until IS NULL OR lease_until <= ?)
            "#,
        )
        .bind(lease_until)
        .bind(message.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;

        debug!(id = message.id, queue = %message.queue, "Claimed message");
        Ok(Some(message))
    }

    // ========================================================================
    // Settling
    // ========================================================================

    /// Acknowledge a claimed message, removing it for good.
    pub async fn ack(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found(format!("queued message {}", id)));
        }
        Ok(())
    }

    /// Give a claimed message back without counting it as a failure.
    pub async fn release(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE queue_messages SET lease_until = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reject a claimed message.
    ///
    /// It is requeued when `requeue` is set and it has been rejected fewer
    /// than `requeue_limit` times before; otherwise it is dead-lettered.
    pub async fn reject(
        &self,
        id: i64,
        requeue: bool,
        error: &str,
        requeue_limit: u32,
    ) -> Result<RejectOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT queue, body, attempts FROM queue_messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(DbError::not_found(format!("queued message {}", id)));
        };
        let queue: String = row.get("queue");
        let body: String = row.get("body");
        let attempts = row.get::<i64, _>("attempts") as u32;

        let outcome = if requeue && attempts < requeue_limit {
            sqlx::query(
                r#"
                UPDATE queue_messages SET
                    attempts = attempts + 1,
                    lease_until = NULL,
                    last_error = ?
                WHERE id = ?
                "#,
            )
            .bind(error)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            RejectOutcome::Requeued
        } else {
            sqlx::query(
                r#"
                INSERT INTO dead_letters (id, queue, body, attempts, error, dead_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(&queue)
            .bind(&body)
            .bind(i64::from(attempts) + 1)
            .bind(error)
            .bind(Self::now_millis())
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM queue_messages WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            RejectOutcome::DeadLettered
        };

        tx.commit().await?;

        if outcome == RejectOutcome::DeadLettered {
            warn!(id, queue = %queue, attempts = attempts + 1, error, "Message dead-lettered");
        }
        Ok(outcome)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN lease_until IS NULL OR lease_until <= ? THEN 1 ELSE 0 END), 0) AS ready,
                COALESCE(SUM(CASE WHEN lease_until > ? THEN 1 ELSE 0 END), 0) AS leased
            FROM queue_messages WHERE queue = ?
            "#,
        )
        .bind(Self::now_millis())
        .bind(Self::now_millis())
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueDepth {
            ready: row.get::<i64, _>("ready") as u64,
            leased: row.get::<i64, _>("leased") as u64,
        })
    }

    /// Messages on `queue` that are not yet acknowledged, leased or not.
    pub async fn pending(&self, queue: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn dead_letters(&self, queue: Option<&str>) -> Result<Vec<DeadLetter>> {
        let rows = match queue {
            Some(queue) => {
                sqlx::query("SELECT * FROM dead_letters WHERE queue = ? ORDER BY dead_at, id")
                    .bind(queue)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM dead_letters ORDER BY dead_at, id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows
            .iter()
            .map(|row| DeadLetter {
                id: row.get("id"),
                queue: row.get("queue"),
                body: row.get("body"),
                attempts: row.get::<i64, _>("attempts") as u32,
                error: row.get("error"),
                dead_at: Self::millis_to_datetime(row.get("dead_at")),
            })
            .collect())
    }
}
