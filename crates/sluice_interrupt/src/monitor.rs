//! Stuck-interrupt reconciliation.
//!
//! An ABORT_ALL or EXPIRE_ALL that has been PROCESSING for longer than the
//! stuck threshold has most likely lost termination completions. Each pass
//! nudges such an interrupt one step closer to a terminal state: re-issue
//! terminations that were never acknowledged, or force the lowest open
//! parents to their terminal status, one level per pass.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use sluice_core::{
    CoreResult, ExecutionTree, Interrupt, InterruptId, InterruptState, InterruptType, NodeExecution,
    NodeExecutionId, Status,
};
use sluice_runtime::{IteratorConfig, PagedHandler};
use sluice_store::{PageRequest, StuckInterruptQuery};
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use crate::handlers::HandlerContext;

/// Interrupt monitor schedule and stuck threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptMonitorConfig {
    /// Iterator schedule
    pub iterator: IteratorConfig,
    /// Age after which a PROCESSING interrupt counts as stuck
    pub stuck_threshold_secs: u64,
}

impl Default for InterruptMonitorConfig {
    fn default() -> Self {
        Self {
            iterator: IteratorConfig::default()
                .with_interval_secs(180)
                .with_pool_size(2)
                .with_item_budget_secs(30),
            stuck_threshold_secs: 600,
        }
    }
}

impl InterruptMonitorConfig {
    /// Set the stuck threshold
    #[must_use]
    pub fn with_stuck_threshold_secs(mut self, secs: u64) -> Self {
        self.stuck_threshold_secs = secs;
        self
    }

    /// Replace the iterator schedule
    #[must_use]
    pub fn with_iterator(mut self, iterator: IteratorConfig) -> Self {
        self.iterator = iterator;
        self
    }
}

/// What one reconciliation step did to an interrupt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Another replica owns this cycle
    Skipped,
    /// Plan already ended or vanished; interrupt closed
    ClosedEndedPlan,
    /// Tree has no leaves; interrupt failed for operator attention
    Corrupt,
    /// Terminations re-issued for this many leaves
    Reissued(usize),
    /// Some leaves are still legitimately running
    Waiting,
    /// This many parents forced to their terminal status
    ForcedParents(usize),
    /// Whole scope final; plan recomputed and interrupt closed
    Closed,
}

/// Periodic sweep over stuck discontinuing interrupts
pub struct InterruptMonitor {
    ctx: HandlerContext,
    config: InterruptMonitorConfig,
}

impl InterruptMonitor {
    /// Iterator name
    pub const NAME: &'static str = "interrupt-monitor";

    /// Create a monitor
    #[must_use]
    pub fn new(ctx: HandlerContext, config: InterruptMonitorConfig) -> Self {
        Self { ctx, config }
    }

    /// Schedule of this monitor
    #[must_use]
    pub fn iterator_config(&self) -> &IteratorConfig {
        &self.config.iterator
    }

    fn query(&self) -> StuckInterruptQuery {
        let now = self.ctx.clock.now();
        let threshold = ChronoDuration::seconds(i64::try_from(self.config.stuck_threshold_secs).unwrap_or(i64::MAX));
        StuckInterruptQuery {
            types: InterruptType::DISCONTINUING.to_vec(),
            state: InterruptState::Processing,
            created_before: now - threshold,
            due_at: now,
        }
    }

    /// Run one reconciliation step for a stuck interrupt
    ///
    /// # Errors
    ///
    /// Returns error if a store fails; the interrupt is retried next cycle
    pub async fn reconcile(&self, interrupt: &Interrupt) -> CoreResult<Reconciliation> {
        let now = self.ctx.clock.now();
        let interval = ChronoDuration::seconds(
            i64::try_from(self.config.iterator.interval_secs).unwrap_or(i64::MAX),
        );
        if !self
            .ctx
            .interrupts
            .claim_iteration(interrupt.id, interrupt.next_iteration, now + interval)
            .await?
        {
            debug!(interrupt_id = %interrupt.id, "Interrupt claimed by another replica");
            return Ok(Reconciliation::Skipped);
        }

        let plan = self
            .ctx
            .executions
            .get_plan_execution(interrupt.plan_execution_id)
            .await?;
        if plan.is_none_or(|p| p.status.is_final()) {
            self.close(interrupt, InterruptState::ProcessedSuccessfully).await?;
            info!(
                interrupt_id = %interrupt.id,
                plan_execution_id = %interrupt.plan_execution_id,
                "Plan already ended, closed stuck interrupt"
            );
            return Ok(Reconciliation::ClosedEndedPlan);
        }

        let tree = ExecutionTree::build(
            self.ctx
                .executions
                .find_node_executions(interrupt.plan_execution_id)
                .await?,
        );
        let leaves: Vec<&NodeExecution> = match interrupt.node_execution_id {
            Some(root) => tree.leaves_under(root),
            None => tree.leaves(),
        };
        if leaves.is_empty() {
            self.close(interrupt, InterruptState::ProcessedUnsuccessfully).await?;
            error!(
                interrupt_id = %interrupt.id,
                plan_execution_id = %interrupt.plan_execution_id,
                "Execution tree has no leaves, interrupt needs operator attention"
            );
            return Ok(Reconciliation::Corrupt);
        }

        let live: Vec<&NodeExecution> = leaves.iter().copied().filter(|n| !n.status.is_final()).collect();
        if !live.is_empty() {
            if !live.iter().all(|n| n.status.is_discontinuable_leaf()) {
                debug!(interrupt_id = %interrupt.id, live = live.len(), "Leaves still running");
                return Ok(Reconciliation::Waiting);
            }
            let mut reissued = 0;
            for leaf in live {
                if self.ctx.discontinue_node(leaf, interrupt).await? {
                    reissued += 1;
                }
            }
            warn!(interrupt_id = %interrupt.id, reissued, "Re-issued lost terminations");
            return Ok(Reconciliation::Reissued(reissued));
        }

        self.walk_up(interrupt, &tree, &leaves).await
    }

    async fn walk_up(
        &self,
        interrupt: &Interrupt,
        tree: &ExecutionTree,
        leaves: &[&NodeExecution],
    ) -> CoreResult<Reconciliation> {
        let scope: HashSet<NodeExecutionId> = match interrupt.node_execution_id {
            Some(root) => tree.subtree(root).iter().map(|n| n.id).collect(),
            None => tree.nodes().map(|n| n.id).collect(),
        };
        let terminal = interrupt.interrupt_type.terminal_status().unwrap_or(Status::Aborted);

        let mut frontier: Vec<NodeExecutionId> = leaves.iter().map(|n| n.id).collect();
        loop {
            let parents: Vec<&NodeExecution> = tree
                .parents_of(&frontier)
                .into_iter()
                .filter(|p| scope.contains(&p.id))
                .collect();
            if parents.is_empty() {
                // everything in scope is final: recompute the plan and close
                if self.ctx.callback.settle(interrupt).await? {
                    return Ok(Reconciliation::Closed);
                }
                return Ok(Reconciliation::Waiting);
            }

            let ready: Vec<&NodeExecution> = parents
                .iter()
                .copied()
                .filter(|p| !p.status.is_final() && tree.all_children_final(p.id))
                .collect();
            if !ready.is_empty() {
                let mut forced = 0;
                for parent in ready {
                    self.ctx
                        .executions
                        .update_node_status(parent.id, Status::Discontinuing, &Status::ACTIVE)
                        .await?;
                    if self
                        .ctx
                        .executions
                        .update_node_status(parent.id, terminal, &Status::ACTIVE)
                        .await?
                        .is_some()
                    {
                        forced += 1;
                    }
                }
                warn!(interrupt_id = %interrupt.id, forced, status = %terminal, "Forced parents to terminal status");
                return Ok(Reconciliation::ForcedParents(forced));
            }

            frontier = parents.iter().map(|p| p.id).collect();
        }
    }

    async fn close(&self, interrupt: &Interrupt, to: InterruptState) -> CoreResult<()> {
        self.ctx
            .interrupts
            .transition(interrupt.id, &[InterruptState::Processing], to)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PagedHandler for InterruptMonitor {
    type Item = Interrupt;
    type Cursor = InterruptId;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn fetch_page(&self, after: Option<InterruptId>, limit: usize) -> CoreResult<Vec<Interrupt>> {
        self.ctx
            .interrupts
            .find_stuck(&self.query(), PageRequest { after, limit })
            .await
    }

    fn cursor(&self, item: &Interrupt) -> InterruptId {
        item.id
    }

    async fn handle(&self, item: Interrupt) -> CoreResult<()> {
        let outcome = self.reconcile(&item).await?;
        debug!(interrupt_id = %item.id, outcome = ?outcome, "Stuck interrupt reconciled");
        Ok(())
    }
}
