//! Termination completion consumer.
//!
//! Completions are delivered at least once and in any order. Every step
//! here is a conditional update keyed on the current status, so replaying a
//! completion changes nothing.

use async_trait::async_trait;
use serde_json::Value;
use sluice_core::{
    CoreResult, ExecutionTree, Interrupt, InterruptId, InterruptState, NodeExecutionId, Status,
};
use sluice_store::{ExecutionStore, InterruptStore, NotifyCallback};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::terminator::parse_termination_key;

/// Finalizes terminated nodes and closes their interrupt once its scope is final
pub struct TerminationCallback {
    executions: Arc<dyn ExecutionStore>,
    interrupts: Arc<dyn InterruptStore>,
}

impl TerminationCallback {
    /// Create a consumer over the given stores
    #[must_use]
    pub fn new(executions: Arc<dyn ExecutionStore>, interrupts: Arc<dyn InterruptStore>) -> Self {
        Self {
            executions,
            interrupts,
        }
    }

    /// Record that `node` stopped on behalf of `interrupt`
    ///
    /// Returns true if this completion closed the interrupt.
    ///
    /// # Errors
    ///
    /// Returns error if a store fails
    pub async fn on_terminated(&self, node: NodeExecutionId, interrupt_id: InterruptId) -> CoreResult<bool> {
        let Some(interrupt) = self.interrupts.get(interrupt_id).await? else {
            warn!(interrupt_id = %interrupt_id, "Completion for unknown interrupt");
            return Ok(false);
        };
        if interrupt.state != InterruptState::Processing {
            debug!(interrupt_id = %interrupt_id, state = %interrupt.state, "Completion after interrupt settled");
            return Ok(false);
        }
        let Some(status) = interrupt.interrupt_type.terminal_status() else {
            return Ok(false);
        };

        if self
            .executions
            .update_node_status(node, status, &Status::ACTIVE)
            .await?
            .is_some()
        {
            debug!(node_execution_id = %node, status = %status, "Node finalized");
        }
        self.settle(&interrupt).await
    }

    /// Finalize parents whose children all ended, then close the interrupt
    /// if its whole scope is final
    ///
    /// Returns true if the interrupt was closed.
    ///
    /// # Errors
    ///
    /// Returns error if a store fails
    pub async fn settle(&self, interrupt: &Interrupt) -> CoreResult<bool> {
        let tree = ExecutionTree::build(
            self.executions
                .find_node_executions(interrupt.plan_execution_id)
                .await?,
        );
        let scope: Vec<NodeExecutionId> = match interrupt.node_execution_id {
            Some(root) => tree.subtree(root).iter().map(|n| n.id).collect(),
            None => tree
                .top_level()
                .iter()
                .flat_map(|top| tree.subtree(top.id))
                .map(|n| n.id)
                .collect(),
        };

        // statuses written during this pass, the arena is a snapshot
        let mut written: HashMap<NodeExecutionId, Status> = HashMap::new();
        let status_of = |written: &HashMap<NodeExecutionId, Status>, id: NodeExecutionId| {
            written
                .get(&id)
                .copied()
                .or_else(|| tree.get(id).map(|n| n.status))
        };

        // reversed pre-order visits children before their parent
        for &id in scope.iter().rev() {
            let Some(node) = tree.get(id) else { continue };
            let children: Vec<Status> = tree
                .children(id)
                .filter_map(|c| status_of(&written, c.id))
                .collect();
            if node.status.is_final() || children.is_empty() || !children.iter().all(|s| s.is_final()) {
                continue;
            }
            let aggregate = Status::aggregate(children);
            if self
                .executions
                .update_node_status(id, aggregate, &Status::ACTIVE)
                .await?
                .is_some()
            {
                debug!(node_execution_id = %id, status = %aggregate, "Parent finalized from children");
            }
            written.insert(id, aggregate);
        }

        let scope_final = scope
            .iter()
            .all(|id| status_of(&written, *id).is_some_and(Status::is_final));
        if !scope_final {
            return Ok(false);
        }

        if interrupt.is_plan_scoped() {
            let top: Vec<Status> = tree
                .top_level()
                .iter()
                .filter_map(|n| status_of(&written, n.id))
                .collect();
            let plan_status = if top.is_empty() {
                interrupt.interrupt_type.terminal_status().unwrap_or(Status::Aborted)
            } else {
                Status::aggregate(top)
            };
            self.executions
                .update_plan_status(interrupt.plan_execution_id, plan_status, &Status::ACTIVE)
                .await?;
            debug!(plan_execution_id = %interrupt.plan_execution_id, status = %plan_status, "Plan finalized");
        }

        let closed = self
            .interrupts
            .transition(
                interrupt.id,
                &[InterruptState::Processing],
                InterruptState::ProcessedSuccessfully,
            )
            .await?;
        if closed.is_some() {
            info!(
                interrupt_id = %interrupt.id,
                plan_execution_id = %interrupt.plan_execution_id,
                interrupt_type = %interrupt.interrupt_type,
                "Interrupt processed"
            );
        }
        Ok(closed.is_some())
    }
}

#[async_trait]
impl NotifyCallback for TerminationCallback {
    async fn notify(&self, key: &str, _payload: Value) {
        let (node, interrupt) = match parse_termination_key(key) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(key, error = %e, "Dropping malformed termination completion");
                return;
            }
        };
        if let Err(e) = self.on_terminated(node, interrupt).await {
            // the interrupt monitor picks this up later
            warn!(key, error = %e, "Failed to apply termination completion");
        }
    }
}
