//! Plan and node execution documents.
//!
//! These are owned by the execution store. The control plane reads them and
//! requests status transitions; it never edits them in place.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::id::{NodeExecutionId, PlanExecutionId};
use crate::status::{ExecutionMode, Status};

/// One run of an orchestrated workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanExecution {
    /// Plan execution id
    pub id: PlanExecutionId,
    /// Current status
    pub status: Status,
    /// Context propagated to every node (account, org, project, ...)
    pub setup_abstractions: IndexMap<String, String>,
    /// Start time
    pub start_ts: DateTime<Utc>,
    /// End time, set once a final status is reached
    pub end_ts: Option<DateTime<Utc>>,
}

impl PlanExecution {
    /// Create a running plan execution
    #[must_use]
    pub fn new(id: PlanExecutionId, start_ts: DateTime<Utc>) -> Self {
        Self {
            id,
            status: Status::Running,
            setup_abstractions: IndexMap::new(),
            start_ts,
            end_ts: None,
        }
    }

    /// Set status
    #[must_use]
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Add a setup abstraction
    #[must_use]
    pub fn with_abstraction(mut self, key: &str, value: &str) -> Self {
        self.setup_abstractions
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Account the plan runs under, if recorded
    #[must_use]
    pub fn account_id(&self) -> Option<&str> {
        self.setup_abstractions.get("accountId").map(String::as_str)
    }
}

/// One coordinate on the path from the plan root to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    /// Plan node (setup node) id
    pub setup_id: String,
    /// Runtime id of the node execution at this level
    pub runtime_id: NodeExecutionId,
    /// Step identifier as written in the pipeline
    pub identifier: String,
}

/// Execution coordinates threaded through the tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    /// Owning plan execution
    pub plan_execution_id: PlanExecutionId,
    /// Ordered levels, root first
    pub levels: Vec<Level>,
}

impl Ambiance {
    /// Ambiance at the plan root
    #[must_use]
    pub fn new(plan_execution_id: PlanExecutionId) -> Self {
        Self {
            plan_execution_id,
            levels: Vec::new(),
        }
    }

    /// Ambiance one level deeper
    #[must_use]
    pub fn child(&self, level: Level) -> Self {
        let mut levels = self.levels.clone();
        levels.push(level);
        Self {
            plan_execution_id: self.plan_execution_id,
            levels,
        }
    }

    /// Innermost level
    #[must_use]
    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }
}

/// One step instance within a plan's execution tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Node execution id
    pub id: NodeExecutionId,
    /// Coordinates
    pub ambiance: Ambiance,
    /// Plan node this execution instantiates
    pub setup_node_id: String,
    /// Parent node execution, `None` at the top level
    pub parent_id: Option<NodeExecutionId>,
    /// Execution mode
    pub mode: ExecutionMode,
    /// Current status
    pub status: Status,
    /// Start time
    pub start_ts: DateTime<Utc>,
    /// End time, set once a final status is reached
    pub end_ts: Option<DateTime<Utc>>,
    /// Superseded by a retry
    pub old_retry: bool,
    /// Node execution this one retries
    pub retry_of: Option<NodeExecutionId>,
}

impl NodeExecution {
    /// Create a running node execution under `parent`
    #[must_use]
    pub fn new(
        plan_execution_id: PlanExecutionId,
        setup_node_id: &str,
        parent_id: Option<NodeExecutionId>,
        mode: ExecutionMode,
        start_ts: DateTime<Utc>,
    ) -> Self {
        let id = NodeExecutionId::new();
        let ambiance = Ambiance::new(plan_execution_id).child(Level {
            setup_id: setup_node_id.to_string(),
            runtime_id: id,
            identifier: setup_node_id.to_string(),
        });
        Self {
            id,
            ambiance,
            setup_node_id: setup_node_id.to_string(),
            parent_id,
            mode,
            status: Status::Running,
            start_ts,
            end_ts: None,
            old_retry: false,
            retry_of: None,
        }
    }

    /// Set status
    #[must_use]
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Owning plan execution
    #[must_use]
    pub fn plan_execution_id(&self) -> PlanExecutionId {
        self.ambiance.plan_execution_id
    }

    /// Fresh queued execution that retries this one
    #[must_use]
    pub fn retried(&self, start_ts: DateTime<Utc>) -> Self {
        let id = NodeExecutionId::new();
        let mut ambiance = self.ambiance.clone();
        if let Some(level) = ambiance.levels.last_mut() {
            level.runtime_id = id;
        }
        Self {
            id,
            ambiance,
            setup_node_id: self.setup_node_id.clone(),
            parent_id: self.parent_id,
            mode: self.mode,
            status: Status::Queued,
            start_ts,
            end_ts: None,
            old_retry: false,
            retry_of: Some(self.id),
        }
    }
}
