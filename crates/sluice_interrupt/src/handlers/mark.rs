use async_trait::async_trait;
use sluice_core::{Interrupt, InterruptState, InterruptType, Status};
use tracing::{info, warn};

use super::{HandlerContext, InterruptHandler};
use crate::error::{InterruptError, InterruptResult};

/// MARK_SUCCESS and MARK_FAILED: overwrite a node's status
pub struct MarkStatusHandler {
    ctx: HandlerContext,
    interrupt_type: InterruptType,
    target: Status,
}

impl MarkStatusHandler {
    /// Handler for MARK_SUCCESS
    #[must_use]
    pub fn success(ctx: HandlerContext) -> Self {
        Self {
            ctx,
            interrupt_type: InterruptType::MarkSuccess,
            target: Status::Succeeded,
        }
    }

    /// Handler for MARK_FAILED
    #[must_use]
    pub fn failed(ctx: HandlerContext) -> Self {
        Self {
            ctx,
            interrupt_type: InterruptType::MarkFailed,
            target: Status::Failed,
        }
    }

    // success may overwrite a failure, failure only overwrites live work
    fn allowed_from(&self) -> Vec<Status> {
        let mut allowed = Status::ACTIVE.to_vec();
        if self.target == Status::Succeeded {
            allowed.extend([Status::Failed, Status::Aborted, Status::Expired]);
        }
        allowed
    }
}

#[async_trait]
impl InterruptHandler for MarkStatusHandler {
    async fn validate(&self, interrupt: &Interrupt) -> InterruptResult<()> {
        self.ctx.live_plan(interrupt.plan_execution_id).await?;
        let node = self.ctx.target_node(interrupt).await?;
        if !self.allowed_from().contains(&node.status) {
            return Err(InterruptError::NodeNotEligible {
                node_execution_id: node.id,
                status: node.status,
                interrupt_type: self.interrupt_type,
            });
        }
        Ok(())
    }

    async fn handle(&self, interrupt: Interrupt) -> InterruptResult<Interrupt> {
        let interrupt = self
            .ctx
            .advance(&interrupt, &[InterruptState::Registered], InterruptState::Processing)
            .await?;
        let node = self.ctx.target_node(&interrupt).await?;
        let updated = self
            .ctx
            .executions
            .update_node_status(node.id, self.target, &self.allowed_from())
            .await?;

        let outcome = if updated.is_some() {
            info!(node_execution_id = %node.id, status = %self.target, "Node status overridden");
            InterruptState::ProcessedSuccessfully
        } else {
            warn!(
                node_execution_id = %node.id,
                interrupt_type = %self.interrupt_type,
                "Node changed status before the override applied"
            );
            InterruptState::ProcessedUnsuccessfully
        };
        Ok(self
            .ctx
            .advance(&interrupt, &[InterruptState::Processing], outcome)
            .await?)
    }
}

/// MARK_EXPIRED: expires one node and everything still running under it
///
/// Closed by the termination completions, like EXPIRE_ALL scoped to the node.
pub struct MarkExpiredHandler {
    ctx: HandlerContext,
}

impl MarkExpiredHandler {
    /// Create the handler
    #[must_use]
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl InterruptHandler for MarkExpiredHandler {
    async fn validate(&self, interrupt: &Interrupt) -> InterruptResult<()> {
        self.ctx.live_plan(interrupt.plan_execution_id).await?;
        let node = self.ctx.target_node(interrupt).await?;
        if node.status.is_final() {
            return Err(InterruptError::NodeNotEligible {
                node_execution_id: node.id,
                status: node.status,
                interrupt_type: InterruptType::MarkExpired,
            });
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
        let requested = self.ctx.discontinue_scope(&interrupt).await?;
        info!(interrupt_id = %interrupt.id, leaves = requested, "Expiring node");
        Ok(self.ctx.interrupts.get(interrupt.id).await?.unwrap_or(interrupt))
    }
}
