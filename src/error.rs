//! Central error taxonomy for the monitoring engine
//!
//! Every fallible core operation returns `EngineError`. The API layer maps
//! variants onto HTTP status codes; task bodies record them into status
//! snapshots instead of propagating.

use crate::transport::TransportError;

/// Errors surfaced by the stores, the collector, and the state machine engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad input, broken referential integrity, or an invariant violation.
    /// `field` names the offending field in dotted-path form.
    #[error("validation failed for '{field}': {message}")]
    Validation { field: String, message: String },

    /// The requested entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// The operation conflicts with existing state (duplicate name,
    /// delete of a referenced instrument).
    #[error("conflict: {0}")]
    Conflict(String),

    /// An instrument could not be reached or answered incorrectly.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A command template referenced a parameter the mode does not supply.
    #[error("missing parameter '{name}' for command template")]
    ParameterMissing { name: String },

    /// A persisted document could not be parsed.
    #[error("corrupt document {path}: {message}")]
    Corruption { path: String, message: String },

    /// Unexpected internal failure (I/O on the data dir, poisoned task).
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Shorthand for a field-level validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: i64) -> Self {
        Self::NotFound { kind, id }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::Internal(message.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display_names_field() {
        let err = EngineError::validation("setup.frequency_hz", "must be positive");
        assert_eq!(
            err.to_string(),
            "validation failed for 'setup.frequency_hz': must be positive"
        );
    }

    #[test]
    fn test_transport_error_is_transparent() {
        let err: EngineError = TransportError::Timeout { ms: 2000 }.into();
        assert!(err.to_string().contains("2000"));
    }
}
