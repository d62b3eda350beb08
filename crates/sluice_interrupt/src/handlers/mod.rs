//! Interrupt handlers.
//!
//! One handler per [`InterruptType`]. A handler validates an interrupt before
//! it is persisted and applies its side effects afterwards, while the
//! registering caller still holds the plan lock.

mod discontinue;
mod mark;
mod pause;
mod retry;

pub use discontinue::DiscontinueHandler;
pub use mark::{MarkExpiredHandler, MarkStatusHandler};
pub use pause::{PauseHandler, ResumeHandler};
pub use retry::RetryHandler;

use async_trait::async_trait;
use sluice_core::{
    Clock, CoreResult, ExecutionTree, Interrupt, InterruptState, InterruptType, NodeExecution,
    PlanExecution, PlanExecutionId, Status, SystemClock,
};
use sluice_restraint::ResourceRestraintService;
use sluice_store::{ExecutionStore, InterruptStore, NotifyBus};
use std::sync::Arc;

use crate::callback::TerminationCallback;
use crate::error::{InterruptError, InterruptResult};
use crate::terminator::{StepTerminator, termination_key};

/// Type-specific behaviour of an interrupt
#[async_trait]
pub trait InterruptHandler: Send + Sync {
    /// Reject interrupts that cannot apply, before anything is persisted
    async fn validate(&self, interrupt: &Interrupt) -> InterruptResult<()>;

    /// Apply the interrupt; returns it in its latest state
    async fn handle(&self, interrupt: Interrupt) -> InterruptResult<Interrupt>;
}

/// Collaborators shared by every handler
#[derive(Clone)]
pub struct HandlerContext {
    /// Execution store
    pub executions: Arc<dyn ExecutionStore>,
    /// Interrupt collection
    pub interrupts: Arc<dyn InterruptStore>,
    /// Notification bus for termination completions
    pub bus: Arc<dyn NotifyBus>,
    /// Step executor
    pub terminator: Arc<dyn StepTerminator>,
    /// Restraint service, for releasing holds of retried stages
    pub restraints: Arc<ResourceRestraintService>,
    /// Consumer of termination completions
    pub callback: Arc<TerminationCallback>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl HandlerContext {
    /// Build a context; the termination callback is derived from the stores
    #[must_use]
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        interrupts: Arc<dyn InterruptStore>,
        bus: Arc<dyn NotifyBus>,
        terminator: Arc<dyn StepTerminator>,
        restraints: Arc<ResourceRestraintService>,
    ) -> Self {
        let callback = Arc::new(TerminationCallback::new(executions.clone(), interrupts.clone()));
        Self {
            executions,
            interrupts,
            bus,
            terminator,
            restraints,
            callback,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a specific clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fetch a plan that has not ended yet
    pub(crate) async fn live_plan(&self, id: PlanExecutionId) -> InterruptResult<PlanExecution> {
        let plan = self
            .executions
            .get_plan_execution(id)
            .await?
            .ok_or(InterruptError::PlanNotFound(id))?;
        if plan.status.is_final() {
            return Err(InterruptError::PlanFinished {
                plan_execution_id: id,
                status: plan.status,
            });
        }
        Ok(plan)
    }

    /// Fetch the node an interrupt targets
    pub(crate) async fn target_node(&self, interrupt: &Interrupt) -> InterruptResult<NodeExecution> {
        let id = interrupt
            .node_execution_id
            .ok_or(InterruptError::NodeRequired(interrupt.interrupt_type))?;
        match self.executions.get_node_execution(id).await? {
            Some(node) if node.plan_execution_id() == interrupt.plan_execution_id => Ok(node),
            _ => Err(InterruptError::NodeNotFound(id)),
        }
    }

    /// Move an interrupt forward, returning its latest version
    pub(crate) async fn advance(
        &self,
        interrupt: &Interrupt,
        from: &[InterruptState],
        to: InterruptState,
    ) -> CoreResult<Interrupt> {
        match self.interrupts.transition(interrupt.id, from, to).await? {
            Some(updated) => Ok(updated),
            None => Ok(self
                .interrupts
                .get(interrupt.id)
                .await?
                .unwrap_or_else(|| interrupt.clone())),
        }
    }

    /// Mark a node DISCONTINUING and ask the executor to stop it
    ///
    /// Safe to repeat: the status update is conditional and the completion
    /// consumer is idempotent.
    pub(crate) async fn discontinue_node(&self, node: &NodeExecution, interrupt: &Interrupt) -> CoreResult<bool> {
        let marked = self
            .executions
            .update_node_status(node.id, Status::Discontinuing, &Status::ACTIVE)
            .await?;
        let Some(node) = marked else {
            tracing::debug!(node_execution_id = %node.id, "Node already final, not discontinuing");
            return Ok(false);
        };
        let key = termination_key(node.id, interrupt.id);
        self.bus.subscribe(&key, self.callback.clone()).await;
        self.terminator.terminate(&node, interrupt, &key).await?;
        tracing::debug!(
            node_execution_id = %node.id,
            interrupt_id = %interrupt.id,
            interrupt_type = %interrupt.interrupt_type,
            "Termination requested"
        );
        Ok(true)
    }

    /// Discontinue every live leaf in the interrupt's scope
    ///
    /// Closes the interrupt at once if nothing is left to stop.
    pub(crate) async fn discontinue_scope(&self, interrupt: &Interrupt) -> CoreResult<usize> {
        let tree = ExecutionTree::build(
            self.executions
                .find_node_executions(interrupt.plan_execution_id)
                .await?,
        );
        let leaves = match interrupt.node_execution_id {
            Some(root) => tree.leaves_under(root),
            None => tree.leaves(),
        };
        let live: Vec<NodeExecution> = leaves
            .into_iter()
            .filter(|n| !n.status.is_final())
            .cloned()
            .collect();

        let mut requested = 0;
        for leaf in &live {
            if self.discontinue_node(leaf, interrupt).await? {
                requested += 1;
            }
        }
        if requested == 0 {
            self.callback.settle(interrupt).await?;
        }
        Ok(requested)
    }

    /// Whether an abort or expiry is still running for the plan
    pub(crate) async fn discontinuing_in_progress(&self, plan: PlanExecutionId) -> CoreResult<bool> {
        let processing = self
            .interrupts
            .find_by_plan(plan, &[InterruptState::Processing])
            .await?;
        Ok(processing
            .iter()
            .any(|i| InterruptType::DISCONTINUING.contains(&i.interrupt_type)))
    }
}
