//! Error types for message encoding and decoding.

use crate::queues::Queue;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A queue name nobody declared.
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// The body is not the shape its queue carries.
    #[error("Malformed message on {queue}: {detail}")]
    Malformed { queue: Queue, detail: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    pub fn malformed(queue: Queue, detail: impl Into<String>) -> Self {
        Self::Malformed {
            queue,
            detail: detail.into(),
        }
    }
}
