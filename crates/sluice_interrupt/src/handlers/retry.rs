use async_trait::async_trait;
use sluice_core::{HoldingScope, Interrupt, InterruptState, ReleaseEntity, Status};
use tracing::{error, info};

use super::{HandlerContext, InterruptHandler};
use crate::error::{InterruptError, InterruptResult};

/// RETRY: replaces a broken node execution with a fresh queued one
///
/// The old execution is kept as an old retry. Stage holds taken by the old
/// attempt are deleted so the new attempt queues for them again, and broken
/// ancestors are reopened.
pub struct RetryHandler {
    ctx: HandlerContext,
}

impl RetryHandler {
    /// Create the handler
    #[must_use]
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    // holds go first so a failure leaves the broken node retryable
    async fn apply(&self, interrupt: &Interrupt) -> InterruptResult<()> {
        let node = self.ctx.target_node(interrupt).await?;
        let plan = interrupt.plan_execution_id;

        let stage_key = ReleaseEntity::stage(plan, &node.setup_node_id).key();
        let released = self
            .ctx
            .restraints
            .delete_instances_for_given_release_type(&[stage_key], HoldingScope::Stage)
            .await?;

        let retry = node.retried(self.ctx.clock.now());
        self.ctx.executions.mark_old_retry(node.id).await?;
        self.ctx.executions.save_node_execution(retry.clone()).await?;

        let mut ancestor = node.parent_id;
        while let Some(id) = ancestor {
            let Some(parent) = self.ctx.executions.get_node_execution(id).await? else {
                break;
            };
            if parent.status.is_broken() {
                self.ctx
                    .executions
                    .update_node_status(parent.id, Status::Running, &[parent.status])
                    .await?;
            }
            ancestor = parent.parent_id;
        }

        info!(
            interrupt_id = %interrupt.id,
            node_execution_id = %node.id,
            retry_node_execution_id = %retry.id,
            released_holds = released,
            "Node retried"
        );
        Ok(())
    }
}

#[async_trait]
impl InterruptHandler for RetryHandler {
    async fn validate(&self, interrupt: &Interrupt) -> InterruptResult<()> {
        self.ctx.live_plan(interrupt.plan_execution_id).await?;
        let node = self.ctx.target_node(interrupt).await?;
        if node.old_retry || !node.status.is_broken() {
            return Err(InterruptError::NodeNotEligible {
                node_execution_id: node.id,
                status: node.status,
                interrupt_type: interrupt.interrupt_type,
            });
        }
        Ok(())
    }

    async fn handle(&self, interrupt: Interrupt) -> InterruptResult<Interrupt> {
        let interrupt = self
            .ctx
            .advance(&interrupt, &[InterruptState::Registered], InterruptState::Processing)
            .await?;
        if let Err(e) = self.apply(&interrupt).await {
            error!(interrupt_id = %interrupt.id, error = %e, "Retry failed");
            self.ctx
                .advance(&interrupt, &[InterruptState::Processing], InterruptState::ProcessedUnsuccessfully)
                .await?;
            return Err(e);
        }
        Ok(self
            .ctx
            .advance(&interrupt, &[InterruptState::Processing], InterruptState::ProcessedSuccessfully)
            .await?)
    }
}
