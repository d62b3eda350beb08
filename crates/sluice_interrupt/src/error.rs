//! Interrupt errors.

use sluice_core::{CoreError, InterruptType, NodeExecutionId, PlanExecutionId, Status};
use sluice_restraint::RestraintError;

/// Interrupt result type
pub type InterruptResult<T> = Result<T, InterruptError>;

/// Errors raised while registering or handling interrupts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterruptError {
    /// Target plan does not exist
    #[error("plan execution {0} not found")]
    PlanNotFound(PlanExecutionId),

    /// Target plan already ended
    #[error("plan execution {plan_execution_id} already finished with status {status}")]
    PlanFinished {
        /// Plan
        plan_execution_id: PlanExecutionId,
        /// Final status
        status: Status,
    },

    /// Interrupt type needs a node and none was given
    #[error("{0} interrupts require a node execution id")]
    NodeRequired(InterruptType),

    /// Target node does not exist in the plan
    #[error("node execution {0} not found in plan")]
    NodeNotFound(NodeExecutionId),

    /// Target node is not in a status the interrupt applies to
    #[error("node execution {node_execution_id} has status {status}, {interrupt_type} does not apply")]
    NodeNotEligible {
        /// Node
        node_execution_id: NodeExecutionId,
        /// Current status
        status: Status,
        /// Interrupt type
        interrupt_type: InterruptType,
    },

    /// An abort or expiry is already running for the plan
    #[error("an abort or expiry is already in progress for plan execution {0}")]
    AlreadyDiscontinuing(PlanExecutionId),

    /// Plan is already paused
    #[error("plan execution {0} is already paused")]
    AlreadyPaused(PlanExecutionId),

    /// Resume without a pause to resume
    #[error("plan execution {0} has no active pause")]
    NoActivePause(PlanExecutionId),

    /// No handler registered for a type
    #[error("no handler registered for {0}")]
    MissingHandler(InterruptType),

    /// Restraint cleanup failed
    #[error(transparent)]
    Restraint(#[from] RestraintError),

    /// Error from a collaborator
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl InterruptError {
    /// Whether the caller may retry the same request unchanged
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Core(e) => e.is_retryable(),
            Self::Restraint(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<InterruptError> for CoreError {
    fn from(err: InterruptError) -> Self {
        match err {
            InterruptError::Core(e) => e,
            InterruptError::Restraint(e) => e.into(),
            InterruptError::PlanNotFound(id) => CoreError::not_found("PlanExecution", id),
            InterruptError::NodeNotFound(id) => CoreError::not_found("NodeExecution", id),
            InterruptError::MissingHandler(_) => CoreError::Internal {
                message: err.to_string(),
            },
            other => CoreError::validation("interrupt", other.to_string()),
        }
    }
}
