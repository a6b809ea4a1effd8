use std::any::Any;

use thiserror::Error;

/// Failure raised while applying a source to a target.
///
/// Data-path failures never escape a propagation pass: the holder logs them,
/// keeps its previous value, and skips notification.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update rejected: {reason}")]
    Rejected { reason: String },

    #[error("source kind mismatch: expected {expected}, found {found}")]
    SourceMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("update panicked: {message}")]
    Panicked { message: String },

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl UpdateError {
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn panicked(payload: &(dyn Any + Send)) -> Self {
        Self::Panicked {
            message: panic_message(payload),
        }
    }
}

/// Best-effort text of a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
