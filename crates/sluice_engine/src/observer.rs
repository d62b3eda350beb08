//! Execution end glue.
//!
//! The engine calls into this observer whenever a plan or a node reaches a
//! final status. It is the fast path for releasing restraint holds and
//! closing leftover interrupts; the monitors cover whatever it misses.

use sluice_core::{CoreResult, HoldingScope, NodeExecution, PlanExecution, ReleaseEntity};
use sluice_interrupt::InterruptManager;
use sluice_restraint::ResourceRestraintService;
use std::sync::Arc;
use tracing::{debug, info};

/// What an end notification cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndReport {
    /// Open interrupts closed
    pub interrupts_closed: usize,
    /// Restraint holds released
    pub holds_released: usize,
}

/// Reacts to executions reaching a final status
pub struct ExecutionEndObserver {
    manager: Arc<InterruptManager>,
    restraints: Arc<ResourceRestraintService>,
}

impl ExecutionEndObserver {
    /// Create an observer
    #[must_use]
    pub fn new(manager: Arc<InterruptManager>, restraints: Arc<ResourceRestraintService>) -> Self {
        Self { manager, restraints }
    }

    /// A plan ended: close its interrupts and release its pipeline holds
    ///
    /// Ignored unless the plan status is final.
    ///
    /// # Errors
    ///
    /// Returns error on store failure or lock contention; safe to repeat
    pub async fn on_plan_end(&self, plan: &PlanExecution) -> CoreResult<EndReport> {
        if !plan.status.is_final() {
            debug!(plan_execution_id = %plan.id, status = %plan.status, "Plan not final, nothing to release");
            return Ok(EndReport::default());
        }
        let interrupts_closed = self.manager.close_open_for_plan(plan.id).await?;
        let holds_released = self
            .restraints
            .release_holds(HoldingScope::Pipeline, &ReleaseEntity::pipeline(plan.id).key())
            .await?;
        info!(
            plan_execution_id = %plan.id,
            status = %plan.status,
            interrupts_closed,
            holds_released,
            "Plan end processed"
        );
        Ok(EndReport {
            interrupts_closed,
            holds_released,
        })
    }

    /// A node ended: release holds scoped to its stage
    ///
    /// # Errors
    ///
    /// Returns error on store failure or lock contention; safe to repeat
    pub async fn on_node_end(&self, node: &NodeExecution) -> CoreResult<EndReport> {
        if !node.status.is_final() {
            return Ok(EndReport::default());
        }
        let entity = ReleaseEntity::stage(node.plan_execution_id(), &node.setup_node_id);
        let holds_released = self
            .restraints
            .release_holds(HoldingScope::Stage, &entity.key())
            .await?;
        if holds_released > 0 {
            debug!(node_execution_id = %node.id, holds_released, "Stage holds released");
        }
        Ok(EndReport {
            interrupts_closed: 0,
            holds_released,
        })
    }
}
