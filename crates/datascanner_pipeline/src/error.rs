//! Stage and broker errors with retry classification.

use datascanner_db::DbError;
use datascanner_engine::EngineError;
use datascanner_protocol::ProtocolError;
use thiserror::Error;

pub type StageResult<T> = std::result::Result<T, StageError>;

/// Why a stage could not finish a message.
///
/// - `Malformed`: the message can never be processed; it is rejected
///   without requeueing and ends up dead-lettered.
/// - `Transient`: processing may succeed later; the message is requeued
///   until the broker's requeue limit is reached.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Malformed message (no retry): {0}")]
    Malformed(String),

    #[error("Transient failure (retry eligible): {0}")]
    Transient(String),
}

impl StageError {
    pub fn malformed(msg: impl ToString) -> Self {
        Self::Malformed(msg.to_string())
    }

    pub fn transient(msg: impl ToString) -> Self {
        Self::Transient(msg.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }
}

impl From<EngineError> for StageError {
    fn from(err: EngineError) -> Self {
        if err.is_malformed() {
            StageError::Malformed(err.to_string())
        } else {
            StageError::Transient(err.to_string())
        }
    }
}

impl From<ProtocolError> for StageError {
    fn from(err: ProtocolError) -> Self {
        StageError::Malformed(err.to_string())
    }
}

impl From<DbError> for StageError {
    fn from(err: DbError) -> Self {
        if err.is_transient() {
            StageError::Transient(err.to_string())
        } else {
            StageError::Malformed(err.to_string())
        }
    }
}

impl From<BrokerError> for StageError {
    fn from(err: BrokerError) -> Self {
        StageError::Transient(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StageError::Transient(format!("stage task failed: {}", err))
    }
}

/// Failures of the queueing layer itself.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Queue database error: {0}")]
    Db(#[from] DbError),

    #[error("Encoding error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Settling a delivery the broker no longer tracks.
    #[error("Unknown delivery {0}")]
    UnknownDelivery(i64),
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_are_classified() {
        let bad: StageError = EngineError::malformed("regex", "unbalanced parenthesis").into();
        assert!(!bad.is_transient());
        let unknown: StageError = EngineError::UnknownType("frobnicator".into()).into();
        assert!(!unknown.is_transient());
        let down: StageError = EngineError::unavailable("//srv/share", "connection refused").into();
        assert!(down.is_transient());
    }
}
