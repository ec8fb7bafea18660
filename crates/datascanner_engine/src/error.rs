//! Error types for the scanning engine

use std::io;
use thiserror::Error;

/// Engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    /// No Source is registered for this URL scheme
    #[error("Unknown URL scheme: {0}")]
    UnknownScheme(String),

    /// No Source, Handle or Rule is registered for this JSON type label
    #[error("Unknown type label: {0}")]
    UnknownType(String),

    /// A JSON payload was structurally wrong
    #[error("Malformed {type_label} object: {detail}")]
    Deserialisation { type_label: String, detail: String },

    /// A backend could not supply what was asked of it. Callers treat the
    /// node as absent.
    #[error("Resource unavailable: {what}: {details}")]
    ResourceUnavailable { what: String, details: String },

    /// The Resource does not offer this kind of access
    #[error("{what} does not support {operation}")]
    Unsupported { what: String, operation: &'static str },

    /// Attempted to open a new Source in a manager returned by `share()`
    #[error("Cannot open {0} in a read-only SourceManager")]
    ReadOnlyManager(String),

    /// A registry already has a handler for this key
    #[error("Duplicate {registry} registration for '{key}'")]
    DuplicateRegistration { registry: &'static str, key: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Create a resource unavailable error.
    pub fn unavailable(what: impl ToString, details: impl ToString) -> Self {
        Self::ResourceUnavailable {
            what: what.to_string(),
            details: details.to_string(),
        }
    }

    /// Create a deserialisation error.
    pub fn malformed(type_label: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Deserialisation {
            type_label: type_label.into(),
            detail: detail.into(),
        }
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(what: impl ToString, operation: &'static str) -> Self {
        Self::Unsupported {
            what: what.to_string(),
            operation,
        }
    }

    /// Whether the pipeline should treat this as "node absent" rather than
    /// as a failure of the message carrying it.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            EngineError::ResourceUnavailable { .. } | EngineError::Io(_) | EngineError::Unsupported { .. }
        )
    }

    /// Whether the error comes from bad input rather than from a backend.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            EngineError::Deserialisation { .. }
                | EngineError::UnknownScheme(_)
                | EngineError::UnknownType(_)
                | EngineError::Json(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EngineError>;
