//! Error types for the governance layer
//!
//! `CallError` is the contract with upstream call sites: transport wrappers
//! convert HTTP and network failures into it, and retry classification reads
//! its structure (status first, message text second). `Error` is what callers
//! of the layer see after the retry machinery has given up.

/// Failure reported by a single upstream call attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The upstream answered with a non-success status.
    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The request timed out before an answer arrived.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The connection could not be established or was dropped.
    #[error("connection failed: {0}")]
    Connection(String),
}

impl CallError {
    /// Status code, when the failure carried one.
    pub fn status(&self) -> Option<u16> {
        match self {
            CallError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Message text used for pattern-based classification.
    pub fn message(&self) -> &str {
        match self {
            CallError::Status { message, .. } => message,
            CallError::Timeout(msg) | CallError::Connection(msg) => msg,
        }
    }
}

/// Errors surfaced to callers of the governance layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The upstream failure was classified fatal; no retry was attempted.
    #[error("upstream call failed: {0}")]
    Fatal(CallError),

    /// Every allowed attempt failed; the last failure is attached.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: CallError },

    /// Shutdown was requested while waiting to retry.
    #[error("aborted by shutdown")]
    Shutdown,

    /// Persisted-state failure (load paths only; routine saves degrade to warnings).
    #[error(transparent)]
    Storage(#[from] common::Error),
}

/// Result alias for governance operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_exposes_status_and_message() {
        let err = CallError::Status {
            status: 429,
            message: "Too Many Requests".into(),
        };
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.message(), "Too Many Requests");

        let err = CallError::Timeout("deadline 30s".into());
        assert_eq!(err.status(), None);
        assert_eq!(err.message(), "deadline 30s");
    }

    #[test]
    fn exhausted_display_names_attempts_and_cause() {
        let err = Error::RetriesExhausted {
            attempts: 5,
            last: CallError::Connection("refused".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("5 attempts"), "got: {msg}");
        assert!(msg.contains("refused"), "got: {msg}");
    }
}
