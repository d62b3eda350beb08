use async_trait::async_trait;
use sluice_core::{Interrupt, InterruptState, InterruptType, Status};
use tracing::info;

use super::{HandlerContext, InterruptHandler};
use crate::error::{InterruptError, InterruptResult};

/// ABORT_ALL and EXPIRE_ALL
///
/// Stops every live leaf of the plan, or of the target node's subtree.
/// The interrupt stays PROCESSING until the termination completions (or the
/// interrupt monitor) bring the whole scope to a final status.
pub struct DiscontinueHandler {
    ctx: HandlerContext,
    interrupt_type: InterruptType,
}

impl DiscontinueHandler {
    /// Handler for ABORT_ALL
    #[must_use]
    pub fn abort(ctx: HandlerContext) -> Self {
        Self {
            ctx,
            interrupt_type: InterruptType::AbortAll,
        }
    }

    /// Handler for EXPIRE_ALL
    #[must_use]
    pub fn expire(ctx: HandlerContext) -> Self {
        Self {
            ctx,
            interrupt_type: InterruptType::ExpireAll,
        }
    }
}

#[async_trait]
impl InterruptHandler for DiscontinueHandler {
    async fn validate(&self, interrupt: &Interrupt) -> InterruptResult<()> {
        self.ctx.live_plan(interrupt.plan_execution_id).await?;
        if interrupt.node_execution_id.is_some() {
            let node = self.ctx.target_node(interrupt).await?;
            if node.status.is_final() {
                return Err(InterruptError::NodeNotEligible {
                    node_execution_id: node.id,
                    status: node.status,
                    interrupt_type: self.interrupt_type,
                });
            }
        }
        if self.ctx.discontinuing_in_progress(interrupt.plan_execution_id).await? {
            return Err(InterruptError::AlreadyDiscontinuing(interrupt.plan_execution_id));
        }
        Ok(())
    }

    async fn handle(&self, interrupt: Interrupt) -> InterruptResult<Interrupt> {
        let interrupt = self
            .ctx
            .advance(&interrupt, &[InterruptState::Registered], InterruptState::Processing)
            .await?;
        if interrupt.state != InterruptState::Processing {
            return Ok(interrupt);
        }
        if interrupt.is_plan_scoped() {
            self.ctx
                .executions
                .update_plan_status(interrupt.plan_execution_id, Status::Discontinuing, &Status::ACTIVE)
                .await?;
        }

        let requested = self.ctx.discontinue_scope(&interrupt).await?;
        info!(
            interrupt_id = %interrupt.id,
            plan_execution_id = %interrupt.plan_execution_id,
            interrupt_type = %self.interrupt_type,
            leaves = requested,
            "Discontinuing leaves"
        );
        Ok(self.ctx.interrupts.get(interrupt.id).await?.unwrap_or(interrupt))
    }
}
