//! Interrupt documents: out-of-band control signals against a plan or node.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::id::{InterruptId, NodeExecutionId, PlanExecutionId};
use crate::status::Status;

/// Kind of control signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    /// Abort every live leaf of the plan (or of a node's subtree)
    AbortAll,
    /// Expire every live leaf of the plan (or of a node's subtree)
    ExpireAll,
    /// Pause the plan
    PauseAll,
    /// Resume a paused plan
    ResumeAll,
    /// Retry a failed node
    Retry,
    /// Expire a single node
    MarkExpired,
    /// Force a node to succeeded
    MarkSuccess,
    /// Force a node to failed
    MarkFailed,
}

impl InterruptType {
    /// Every interrupt type, for exhaustive handler registration
    pub const ALL: [InterruptType; 8] = [
        InterruptType::AbortAll,
        InterruptType::ExpireAll,
        InterruptType::PauseAll,
        InterruptType::ResumeAll,
        InterruptType::Retry,
        InterruptType::MarkExpired,
        InterruptType::MarkSuccess,
        InterruptType::MarkFailed,
    ];

    /// Types whose completion arrives through termination callbacks
    pub const DISCONTINUING: [InterruptType; 2] = [InterruptType::AbortAll, InterruptType::ExpireAll];

    /// Final status this interrupt drives its targets to, if it terminates them
    #[must_use]
    pub fn terminal_status(self) -> Option<Status> {
        match self {
            InterruptType::AbortAll => Some(Status::Aborted),
            InterruptType::ExpireAll | InterruptType::MarkExpired => Some(Status::Expired),
            InterruptType::MarkSuccess => Some(Status::Succeeded),
            InterruptType::MarkFailed => Some(Status::Failed),
            _ => None,
        }
    }

    /// Whether the interrupt must name a node execution
    #[must_use]
    pub fn requires_node(self) -> bool {
        matches!(
            self,
            InterruptType::Retry
                | InterruptType::MarkExpired
                | InterruptType::MarkSuccess
                | InterruptType::MarkFailed
        )
    }

    /// Whether the interrupt acts on the plan as a whole
    #[must_use]
    pub fn is_plan_level(self) -> bool {
        matches!(
            self,
            InterruptType::AbortAll
                | InterruptType::ExpireAll
                | InterruptType::PauseAll
                | InterruptType::ResumeAll
        )
    }

    /// Upper-case wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            InterruptType::AbortAll => "ABORT_ALL",
            InterruptType::ExpireAll => "EXPIRE_ALL",
            InterruptType::PauseAll => "PAUSE_ALL",
            InterruptType::ResumeAll => "RESUME_ALL",
            InterruptType::Retry => "RETRY",
            InterruptType::MarkExpired => "MARK_EXPIRED",
            InterruptType::MarkSuccess => "MARK_SUCCESS",
            InterruptType::MarkFailed => "MARK_FAILED",
        }
    }
}

impl std::fmt::Display for InterruptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state of an interrupt
///
/// Transitions are monotonic: REGISTERED -> PROCESSING -> terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    /// Persisted, not yet acted upon
    Registered,
    /// Side effects issued, waiting for completion
    Processing,
    /// Done
    ProcessedSuccessfully,
    /// Gave up; needs operator attention
    ProcessedUnsuccessfully,
}

impl InterruptState {
    /// States that may still make progress
    pub const OPEN: [InterruptState; 2] = [InterruptState::Registered, InterruptState::Processing];

    /// Whether the state is terminal
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InterruptState::ProcessedSuccessfully | InterruptState::ProcessedUnsuccessfully
        )
    }

    fn rank(self) -> u8 {
        match self {
            InterruptState::Registered => 0,
            InterruptState::Processing => 1,
            InterruptState::ProcessedSuccessfully | InterruptState::ProcessedUnsuccessfully => 2,
        }
    }

    /// Whether moving to `next` keeps the state machine monotonic
    #[must_use]
    pub fn can_transition_to(self, next: InterruptState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Upper-case wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            InterruptState::Registered => "REGISTERED",
            InterruptState::Processing => "PROCESSING",
            InterruptState::ProcessedSuccessfully => "PROCESSED_SUCCESSFULLY",
            InterruptState::ProcessedUnsuccessfully => "PROCESSED_UNSUCCESSFULLY",
        }
    }
}

impl std::fmt::Display for InterruptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who issued an interrupt, and when
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InterruptConfig {
    /// Issuer identifier (user, trigger, timeout engine, ...)
    pub issued_by: Option<String>,
    /// Time the issuer asked for the interrupt
    pub issued_at: Option<DateTime<Utc>>,
}

/// Caller request to register an interrupt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptPackage {
    /// Target plan
    pub plan_execution_id: PlanExecutionId,
    /// Interrupt type
    pub interrupt_type: InterruptType,
    /// Target node, `None` for plan scope
    pub node_execution_id: Option<NodeExecutionId>,
    /// Free-form parameters for the handler
    pub parameters: IndexMap<String, String>,
    /// Free-form metadata recorded on the interrupt
    pub metadata: IndexMap<String, String>,
    /// Issuer
    pub interrupt_config: InterruptConfig,
}

impl InterruptPackage {
    /// Create a plan-scoped package
    #[must_use]
    pub fn new(plan_execution_id: PlanExecutionId, interrupt_type: InterruptType) -> Self {
        Self {
            plan_execution_id,
            interrupt_type,
            node_execution_id: None,
            parameters: IndexMap::new(),
            metadata: IndexMap::new(),
            interrupt_config: InterruptConfig::default(),
        }
    }

    /// Target a node
    #[must_use]
    pub fn with_node(mut self, node_execution_id: NodeExecutionId) -> Self {
        self.node_execution_id = Some(node_execution_id);
        self
    }

    /// Record the issuer
    #[must_use]
    pub fn issued_by(mut self, issuer: &str) -> Self {
        self.interrupt_config.issued_by = Some(issuer.to_string());
        self
    }

    /// Add a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// A persisted interrupt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interrupt {
    /// Interrupt id
    pub id: InterruptId,
    /// Target plan
    pub plan_execution_id: PlanExecutionId,
    /// Target node, `None` for plan scope
    pub node_execution_id: Option<NodeExecutionId>,
    /// Interrupt type
    pub interrupt_type: InterruptType,
    /// Processing state
    pub state: InterruptState,
    /// Issuer
    pub interrupt_config: InterruptConfig,
    /// Handler parameters
    pub parameters: IndexMap<String, String>,
    /// Free-form metadata
    pub metadata: IndexMap<String, String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Earliest time the monitor may look at this interrupt again
    pub next_iteration: Option<DateTime<Utc>>,
}

impl Interrupt {
    /// Build a freshly registered interrupt from a package
    #[must_use]
    pub fn from_package(package: InterruptPackage, created_at: DateTime<Utc>) -> Self {
        Self {
            id: InterruptId::new(),
            plan_execution_id: package.plan_execution_id,
            node_execution_id: package.node_execution_id,
            interrupt_type: package.interrupt_type,
            state: InterruptState::Registered,
            interrupt_config: package.interrupt_config,
            parameters: package.parameters,
            metadata: package.metadata,
            created_at,
            next_iteration: None,
        }
    }

    /// Whether the interrupt targets the whole plan
    #[must_use]
    pub fn is_plan_scoped(&self) -> bool {
        self.node_execution_id.is_none()
    }
}
