use async_trait::async_trait;
use sluice_core::{Interrupt, InterruptState, InterruptType, Status};
use tracing::info;

use super::{HandlerContext, InterruptHandler};
use crate::error::{InterruptError, InterruptResult};

/// PAUSE_ALL: holds the plan and its queued leaves
///
/// The interrupt stays PROCESSING for as long as the pause lasts.
pub struct PauseHandler {
    ctx: HandlerContext,
}

impl PauseHandler {
    /// Create the handler
    #[must_use]
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl InterruptHandler for PauseHandler {
    async fn validate(&self, interrupt: &Interrupt) -> InterruptResult<()> {
        let plan = self.ctx.live_plan(interrupt.plan_execution_id).await?;
        match plan.status {
            Status::Paused | Status::Pausing => Err(InterruptError::AlreadyPaused(plan.id)),
            Status::Discontinuing => Err(InterruptError::AlreadyDiscontinuing(plan.id)),
            _ => Ok(()),
        }
    }

    async fn handle(&self, interrupt: Interrupt) -> InterruptResult<Interrupt> {
        let interrupt = self
            .ctx
            .advance(&interrupt, &[InterruptState::Registered], InterruptState::Processing)
            .await?;
        let plan = interrupt.plan_execution_id;
        self.ctx
            .executions
            .update_plan_status(plan, Status::Paused, &[Status::Running, Status::Queued])
            .await?;

        let mut paused = 0;
        for node in self.ctx.executions.find_node_executions(plan).await? {
            if node.old_retry || node.status != Status::Queued {
                continue;
            }
            if self
                .ctx
                .executions
                .update_node_status(node.id, Status::Paused, &[Status::Queued])
                .await?
                .is_some()
            {
                paused += 1;
            }
        }
        info!(interrupt_id = %interrupt.id, plan_execution_id = %plan, paused, "Plan paused");
        Ok(interrupt)
    }
}

/// RESUME_ALL: releases an active pause
pub struct ResumeHandler {
    ctx: HandlerContext,
}

impl ResumeHandler {
    /// Create the handler
    #[must_use]
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    async fn active_pauses(&self, interrupt: &Interrupt) -> InterruptResult<Vec<Interrupt>> {
        Ok(self
            .ctx
            .interrupts
            .find_by_plan(interrupt.plan_execution_id, &[InterruptState::Processing])
            .await?
            .into_iter()
            .filter(|i| i.interrupt_type == InterruptType::PauseAll)
            .collect())
    }
}

#[async_trait]
impl InterruptHandler for ResumeHandler {
    async fn validate(&self, interrupt: &Interrupt) -> InterruptResult<()> {
        self.ctx.live_plan(interrupt.plan_execution_id).await?;
        if self.active_pauses(interrupt).await?.is_empty() {
            return Err(InterruptError::NoActivePause(interrupt.plan_execution_id));
        }
        Ok(())
    }

    async fn handle(&self, interrupt: Interrupt) -> InterruptResult<Interrupt> {
        let interrupt = self
            .ctx
            .advance(&interrupt, &[InterruptState::Registered], InterruptState::Processing)
            .await?;
        let plan = interrupt.plan_execution_id;
        for pause in self.active_pauses(&interrupt).await? {
            self.ctx
                .advance(&pause, &[InterruptState::Processing], InterruptState::ProcessedSuccessfully)
                .await?;
        }
        self.ctx
            .executions
            .update_plan_status(plan, Status::Running, &[Status::Paused, Status::Pausing])
            .await?;

        let mut resumed = 0;
        for node in self.ctx.executions.find_node_executions(plan).await? {
            if node.old_retry || node.status != Status::Paused {
                continue;
            }
            if self
                .ctx
                .executions
                .update_node_status(node.id, Status::Queued, &[Status::Paused])
                .await?
                .is_some()
            {
                resumed += 1;
            }
        }
        info!(interrupt_id = %interrupt.id, plan_execution_id = %plan, resumed, "Plan resumed");
        Ok(self
            .ctx
            .advance(&interrupt, &[InterruptState::Processing], InterruptState::ProcessedSuccessfully)
            .await?)
    }
}
