//! Core error types for SLUICE.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid encoding
    InvalidEncoding,

    /// Invalid ID format
    InvalidId {
        /// Why the id was rejected
        reason: String,
    },

    /// Validation error
    Validation {
        /// Offending field
        field: String,
        /// What is wrong with it
        reason: String,
    },

    /// Not found
    NotFound {
        /// Document kind
        kind: String,
        /// Document id
        id: String,
    },

    /// Already exists
    AlreadyExists {
        /// Document kind
        kind: String,
        /// Document id
        id: String,
    },

    /// A conditional update lost against a concurrent writer
    Conflict {
        /// Document kind
        kind: String,
        /// Document id
        id: String,
    },

    /// State machine refused a transition
    InvalidTransition {
        /// Document kind
        kind: String,
        /// Document id
        id: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Named lock could not be acquired within its timeout
    LockUnavailable {
        /// Lock name
        name: String,
    },

    /// Backing store failure
    Store {
        /// Error message
        message: String,
    },

    /// Timeout
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Cancelled
    Cancelled,

    /// Internal error (for unexpected errors)
    Internal {
        /// Error message
        message: String,
    },
}

impl CoreError {
    /// Shorthand for a not-found error
    #[must_use]
    pub fn not_found(kind: &str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Shorthand for a validation error
    #[must_use]
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same request unchanged
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockUnavailable { .. } | Self::Conflict { .. } | Self::Timeout { .. }
        )
    }

    /// Whether this error reports a missing document
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding => write!(f, "Invalid encoding"),
            Self::InvalidId { reason } => write!(f, "Invalid ID: {}", reason),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::AlreadyExists { kind, id } => write!(f, "{} already exists: {}", kind, id),
            Self::Conflict { kind, id } => {
                write!(f, "Concurrent update conflict on {} {}", kind, id)
            }
            Self::InvalidTransition { kind, id, from, to } => {
                write!(f, "{} {} cannot move from {} to {}", kind, id, from, to)
            }
            Self::LockUnavailable { name } => {
                write!(f, "Could not acquire lock {}, please retry", name)
            }
            Self::Store { message } => write!(f, "Store error: {}", message),
            Self::Timeout { operation } => write!(f, "Timeout: {}", operation),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(_err: serde_json::Error) -> Self {
        Self::InvalidEncoding
    }
}

impl From<uuid::Error> for CoreError {
    fn from(err: uuid::Error) -> Self {
        Self::InvalidId {
            reason: err.to_string(),
        }
    }
}
