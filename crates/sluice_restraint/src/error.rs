//! Restraint errors.

use sluice_core::{CoreError, RestraintId, RestraintInstanceId};

/// Restraint result type
pub type RestraintResult<T> = Result<T, RestraintError>;

/// Errors raised by the restraint service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RestraintError {
    /// Restraint capacity must be positive
    #[error("restraint capacity must be at least 1")]
    ZeroCapacity,

    /// Requested permits do not fit the restraint at all
    #[error("requested {requested} permits, restraint allows 1..={capacity}")]
    InvalidPermits {
        /// Requested permits
        requested: u32,
        /// Restraint capacity
        capacity: u32,
    },

    /// Unknown restraint
    #[error("resource restraint {0} not found")]
    RestraintNotFound(RestraintId),

    /// Unknown instance on a caller-driven operation
    #[error("resource restraint instance {0} not found")]
    InstanceNotFound(RestraintInstanceId),

    /// Order assignment kept losing against concurrent writers
    #[error("could not assign an order for restraint {restraint_id} after {attempts} attempts")]
    OrderContention {
        /// Restraint
        restraint_id: RestraintId,
        /// Attempts made
        attempts: u32,
    },

    /// A blocked instance does not fit yet, or waits behind older instances
    #[error(
        "instance {id} cannot be activated: {acquired} + {requested} permits on capacity {capacity}, {ahead} waiting ahead"
    )]
    NotAdmissible {
        /// Instance
        id: RestraintInstanceId,
        /// Permits currently ACTIVE on the unit
        acquired: u32,
        /// Permits the instance asks for
        requested: u32,
        /// Restraint capacity
        capacity: u32,
        /// Older BLOCKED instances on the unit under FIFO
        ahead: usize,
    },

    /// Error from a collaborator
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl RestraintError {
    /// Whether the caller may retry the same request unchanged
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OrderContention { .. } => true,
            Self::Core(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether the error reports a missing restraint or instance
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::RestraintNotFound(_) | Self::InstanceNotFound(_) => true,
            Self::Core(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl From<RestraintError> for CoreError {
    fn from(err: RestraintError) -> Self {
        match err {
            RestraintError::ZeroCapacity => CoreError::validation("capacity", err.to_string()),
            RestraintError::InvalidPermits { .. } => CoreError::validation("permits", err.to_string()),
            RestraintError::RestraintNotFound(id) => CoreError::not_found("ResourceRestraint", id),
            RestraintError::InstanceNotFound(id) => {
                CoreError::not_found("ResourceRestraintInstance", id)
            }
            RestraintError::OrderContention { restraint_id, .. } => CoreError::Conflict {
                kind: "ResourceRestraintInstance".to_string(),
                id: restraint_id.to_string(),
            },
            RestraintError::NotAdmissible { id, .. } => CoreError::InvalidTransition {
                kind: "ResourceRestraintInstance".to_string(),
                id: id.to_string(),
                from: "BLOCKED".to_string(),
                to: "ACTIVE".to_string(),
            },
            RestraintError::Core(e) => e,
        }
    }
}
