//! Rows handed out by the queue and the report store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Queue
// ============================================================================

/// A message claimed from a queue. Its lease must be settled with
/// `ack` or `reject` before it expires, or it becomes visible again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: i64,
    pub queue: String,
    pub body: String,
    /// Rejections so far.
    pub attempts: u32,
}

/// What `reject` did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectOutcome {
    Requeued,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Waiting to be claimed.
    pub ready: u64,
    /// Claimed and not yet settled.
    pub leased: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.ready + self.leased
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub id: i64,
    pub queue: String,
    pub body: String,
    pub attempts: u32,
    pub error: Option<String>,
    pub dead_at: DateTime<Utc>,
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub scan_tag: String,
    pub handle: String,
    pub matched: bool,
    /// The exported matches message.
    pub body: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub scan_tag: String,
    pub handle: String,
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemRecord {
    pub id: i64,
    pub scan_tag: Option<String>,
    /// The censored Source or Handle the problem concerns.
    pub location: Option<Value>,
    pub problem: String,
    pub body: Value,
    pub recorded_at: DateTime<Utc>,
}
