//! Interrupt registry.
//!
//! Registration is linearized per plan by the lock
//! `PLAN_EXECUTION_INFO_<planExecutionId>`. The lock guard lives for the whole
//! validate, persist and handle sequence and is released when it drops, on
//! every exit path.

use sluice_core::{
    Clock, Interrupt, InterruptId, InterruptPackage, InterruptState, PlanExecutionId, SystemClock,
};
use sluice_store::{InterruptStore, LockProvider, acquire_or_retry_later};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{InterruptError, InterruptResult};
use crate::factory::HandlerFactory;

/// Registers interrupts and dispatches them to their handlers
pub struct InterruptManager {
    interrupts: Arc<dyn InterruptStore>,
    locks: Arc<dyn LockProvider>,
    factory: HandlerFactory,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

/// Name of the per-plan registration lock
#[must_use]
pub fn plan_lock_name(plan_execution_id: PlanExecutionId) -> String {
    format!("PLAN_EXECUTION_INFO_{}", plan_execution_id)
}

impl InterruptManager {
    /// Create a manager with a 15 second lock timeout
    #[must_use]
    pub fn new(interrupts: Arc<dyn InterruptStore>, locks: Arc<dyn LockProvider>, factory: HandlerFactory) -> Self {
        Self {
            interrupts,
            locks,
            factory,
            clock: Arc::new(SystemClock),
            lock_timeout: Duration::from_secs(15),
        }
    }

    /// Use a specific clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set how long registration waits for the plan lock
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Register an interrupt and apply it
    ///
    /// # Errors
    ///
    /// Returns a retryable error if the plan lock is busy, and a validation
    /// error if the interrupt cannot apply to the plan in its current state
    pub async fn register(&self, package: InterruptPackage) -> InterruptResult<Interrupt> {
        let interrupt_type = package.interrupt_type;
        if interrupt_type.requires_node() && package.node_execution_id.is_none() {
            return Err(InterruptError::NodeRequired(interrupt_type));
        }
        let handler = self.factory.get(interrupt_type)?;

        let lock_name = plan_lock_name(package.plan_execution_id);
        let _lock = acquire_or_retry_later(self.locks.as_ref(), &lock_name, self.lock_timeout).await?;
        debug!(lock = %lock_name, interrupt_type = %interrupt_type, "Plan lock acquired");

        let now = self.clock.now();
        let mut interrupt = Interrupt::from_package(package, now);
        if interrupt.interrupt_config.issued_at.is_none() {
            interrupt.interrupt_config.issued_at = Some(now);
        }

        handler.validate(&interrupt).await?;
        let interrupt = self.interrupts.save(interrupt).await?;
        info!(
            interrupt_id = %interrupt.id,
            plan_execution_id = %interrupt.plan_execution_id,
            interrupt_type = %interrupt_type,
            issued_by = interrupt.interrupt_config.issued_by.as_deref().unwrap_or("unknown"),
            "Interrupt registered"
        );
        handler.handle(interrupt).await
    }

    /// Fetch an interrupt
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    pub async fn get(&self, id: InterruptId) -> InterruptResult<Option<Interrupt>> {
        Ok(self.interrupts.get(id).await?)
    }

    /// Interrupts of a plan that have not reached a terminal state
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    pub async fn find_open(&self, plan_execution_id: PlanExecutionId) -> InterruptResult<Vec<Interrupt>> {
        Ok(self
            .interrupts
            .find_by_plan(plan_execution_id, &InterruptState::OPEN)
            .await?)
    }

    /// Close every open interrupt of a plan that has ended
    ///
    /// Returns the number of interrupts closed.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    pub async fn close_open_for_plan(&self, plan_execution_id: PlanExecutionId) -> InterruptResult<usize> {
        let mut closed = 0;
        for interrupt in self.find_open(plan_execution_id).await? {
            let moved = self
                .interrupts
                .transition(
                    interrupt.id,
                    &InterruptState::OPEN,
                    InterruptState::ProcessedSuccessfully,
                )
                .await?;
            if moved.is_some() {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(plan_execution_id = %plan_execution_id, closed, "Closed interrupts of ended plan");
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::HandlerContext;
    use crate::terminator::{LoopbackTerminator, RecordingTerminator, StepTerminator};
    use chrono::Utc;
    use sluice_core::{
        CoreError, ExecutionMode, HoldingScope, InterruptType, NodeExecution, NodeExecutionId, PlanExecution,
        ReleaseEntity, Status, Strategy,
    };
    use sluice_restraint::{AdmissionRequest, ResourceRestraintService, RestraintServiceConfig, restraint_lock_name};
    use sluice_store::{
        ExecutionStore, InMemoryLockProvider, InMemoryNotifyBus, MemoryExecutionStore, MemoryInterruptStore,
        MemoryRestraintLedger, NotifyBus, RestraintLedger,
    };

    struct Fixture {
        manager: Arc<InterruptManager>,
        executions: Arc<MemoryExecutionStore>,
        locks: Arc<InMemoryLockProvider>,
        restraints: Arc<ResourceRestraintService>,
        plan: PlanExecutionId,
        stage: NodeExecutionId,
        steps: Vec<NodeExecutionId>,
    }

    // plan -> stage -> {a, b}, both steps running
    async fn fixture(loopback: bool) -> Fixture {
        let executions = Arc::new(MemoryExecutionStore::new());
        let interrupts = Arc::new(MemoryInterruptStore::new());
        let locks = Arc::new(InMemoryLockProvider::new());
        let bus: Arc<dyn NotifyBus> = Arc::new(InMemoryNotifyBus::new());
        let terminator: Arc<dyn StepTerminator> = if loopback {
            Arc::new(LoopbackTerminator::new(bus.clone()))
        } else {
            Arc::new(RecordingTerminator::new())
        };
        let restraints = Arc::new(
            ResourceRestraintService::new(Arc::new(MemoryRestraintLedger::new()), executions.clone(), locks.clone())
                .with_config(RestraintServiceConfig::default().with_lock_timeout(Duration::from_millis(50))),
        );
        let ctx = HandlerContext::new(executions.clone(), interrupts.clone(), bus, terminator, restraints.clone());
        let manager = InterruptManager::new(interrupts, locks.clone(), HandlerFactory::standard(&ctx))
            .with_lock_timeout(Duration::from_millis(50));

        let plan = PlanExecution::new(PlanExecutionId::new(), Utc::now());
        let plan_id = plan.id;
        executions.save_plan_execution(plan).await.unwrap();
        let stage = NodeExecution::new(plan_id, "stage", None, ExecutionMode::Child, Utc::now())
            .with_status(Status::Running);
        executions.save_node_execution(stage.clone()).await.unwrap();
        let mut steps = Vec::new();
        for name in ["a", "b"] {
            let step = NodeExecution::new(plan_id, name, Some(stage.id), ExecutionMode::Task, Utc::now())
                .with_status(Status::Running);
            steps.push(step.id);
            executions.save_node_execution(step).await.unwrap();
        }

        Fixture {
            manager: Arc::new(manager),
            executions,
            locks,
            restraints,
            plan: plan_id,
            stage: stage.id,
            steps,
        }
    }

    async fn plan_status(f: &Fixture) -> Status {
        f.executions.get_plan_execution(f.plan).await.unwrap().unwrap().status
    }

    async fn node_status(f: &Fixture, id: NodeExecutionId) -> Status {
        f.executions.get_node_execution(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_busy_plan_lock_is_retryable() {
        let f = fixture(true).await;
        let held = f
            .locks
            .try_acquire(&plan_lock_name(f.plan), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        let err = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::AbortAll))
            .await
            .unwrap_err();
        assert!(matches!(err, InterruptError::Core(CoreError::LockUnavailable { .. })));
        assert!(err.is_retryable());
        assert!(f.manager.find_open(f.plan).await.unwrap().is_empty());

        held.release();
        assert!(f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::AbortAll))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_registrations_are_linearized() {
        let f = fixture(false).await;
        let f = Arc::new(f);
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let manager = f.manager.clone();
            let plan = f.plan;
            tasks.push(tokio::spawn(async move {
                manager
                    .register(InterruptPackage::new(plan, InterruptType::AbortAll))
                    .await
            }));
        }
        let mut accepted = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(InterruptError::AlreadyDiscontinuing(_)) => rejected += 1,
                Err(InterruptError::Core(CoreError::LockUnavailable { .. })) => rejected += 1,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!((accepted, rejected), (1, 1));
        assert_eq!(f.manager.find_open(f.plan).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_all_completes_through_callbacks() {
        let f = fixture(true).await;
        let interrupt = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::AbortAll).issued_by("ops"))
            .await
            .unwrap();

        assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);
        assert!(interrupt.interrupt_config.issued_at.is_some());
        for step in &f.steps {
            assert_eq!(node_status(&f, *step).await, Status::Aborted);
        }
        assert_eq!(node_status(&f, f.stage).await, Status::Aborted);
        assert_eq!(plan_status(&f).await, Status::Aborted);
    }

    #[tokio::test]
    async fn test_abort_without_completions_stays_processing() {
        let f = fixture(false).await;
        let interrupt = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::ExpireAll))
            .await
            .unwrap();
        assert_eq!(interrupt.state, InterruptState::Processing);
        assert_eq!(node_status(&f, f.steps[0]).await, Status::Discontinuing);
        assert_eq!(plan_status(&f).await, Status::Discontinuing);

        let err = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::PauseAll))
            .await
            .unwrap_err();
        assert_eq!(err, InterruptError::AlreadyDiscontinuing(f.plan));
    }

    #[tokio::test]
    async fn test_node_scoped_abort_leaves_siblings_running() {
        let f = fixture(true).await;
        let interrupt = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::AbortAll).with_node(f.steps[0]))
            .await
            .unwrap();
        assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);
        assert_eq!(node_status(&f, f.steps[0]).await, Status::Aborted);
        assert_eq!(node_status(&f, f.steps[1]).await, Status::Running);
        assert_eq!(plan_status(&f).await, Status::Running);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_targets() {
        let f = fixture(true).await;
        let err = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::Retry))
            .await
            .unwrap_err();
        assert_eq!(err, InterruptError::NodeRequired(InterruptType::Retry));

        let missing = PlanExecutionId::new();
        let err = f
            .manager
            .register(InterruptPackage::new(missing, InterruptType::AbortAll))
            .await
            .unwrap_err();
        assert_eq!(err, InterruptError::PlanNotFound(missing));

        f.executions
            .update_plan_status(f.plan, Status::Succeeded, &[])
            .await
            .unwrap();
        let err = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::AbortAll))
            .await
            .unwrap_err();
        assert!(matches!(err, InterruptError::PlanFinished { .. }));
        assert!(f.manager.find_open(f.plan).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_then_resume() {
        let f = fixture(true).await;
        let err = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::ResumeAll))
            .await
            .unwrap_err();
        assert_eq!(err, InterruptError::NoActivePause(f.plan));

        f.executions
            .update_node_status(f.steps[1], Status::Queued, &[])
            .await
            .unwrap();
        let pause = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::PauseAll))
            .await
            .unwrap();
        assert_eq!(pause.state, InterruptState::Processing);
        assert_eq!(plan_status(&f).await, Status::Paused);
        assert_eq!(node_status(&f, f.steps[1]).await, Status::Paused);

        let err = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::PauseAll))
            .await
            .unwrap_err();
        assert_eq!(err, InterruptError::AlreadyPaused(f.plan));

        let resume = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::ResumeAll))
            .await
            .unwrap();
        assert_eq!(resume.state, InterruptState::ProcessedSuccessfully);
        assert_eq!(plan_status(&f).await, Status::Running);
        assert_eq!(node_status(&f, f.steps[1]).await, Status::Queued);
        let pause = f.manager.get(pause.id).await.unwrap().unwrap();
        assert_eq!(pause.state, InterruptState::ProcessedSuccessfully);
    }

    #[tokio::test]
    async fn test_retry_completes_while_restraint_unit_is_busy() {
        let f = fixture(true).await;
        f.executions
            .update_node_status(f.steps[0], Status::Failed, &[])
            .await
            .unwrap();
        let failed = f.executions.get_node_execution(f.steps[0]).await.unwrap().unwrap();

        let restraint = f
            .restraints
            .create_restraint("acc", "db-lock", 1, Strategy::Fifo)
            .await
            .unwrap();
        let old_hold = f
            .restraints
            .request_admission(AdmissionRequest::new(
                restraint.id,
                "prod",
                ReleaseEntity::stage(f.plan, &failed.setup_node_id),
            ))
            .await
            .unwrap();
        let other = PlanExecution::new(PlanExecutionId::new(), Utc::now());
        let other_id = other.id;
        f.executions.save_plan_execution(other).await.unwrap();
        let waiter = f
            .restraints
            .request_admission(AdmissionRequest::new(restraint.id, "prod", ReleaseEntity::pipeline(other_id)))
            .await
            .unwrap();
        assert!(!waiter.admitted_now);

        let unit_lock = f
            .locks
            .try_acquire(&restraint_lock_name(restraint.id, "prod"), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let interrupt = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::Retry).with_node(failed.id))
            .await
            .unwrap();
        assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);
        assert!(f.manager.find_open(f.plan).await.unwrap().is_empty());
        assert!(
            f.restraints
                .ledger()
                .get_instance(old_hold.instance.id)
                .await
                .unwrap()
                .is_none()
        );
        let old = f.executions.get_node_execution(failed.id).await.unwrap().unwrap();
        assert!(old.old_retry);

        // the waiter is promoted once the unit is free again
        drop(unit_lock);
        let promoted = f.restraints.update_blocked_constraints(&[restraint.id]).await.unwrap();
        assert_eq!(promoted, 1);
    }

    #[tokio::test]
    async fn test_retry_replaces_node_and_releases_stage_holds() {
        let f = fixture(true).await;
        f.executions
            .update_node_status(f.steps[0], Status::Failed, &[])
            .await
            .unwrap();
        f.executions
            .update_node_status(f.stage, Status::Failed, &[])
            .await
            .unwrap();
        let failed = f.executions.get_node_execution(f.steps[0]).await.unwrap().unwrap();

        let restraint = f
            .restraints
            .create_restraint("acc", "db-lock", 1, Strategy::Fifo)
            .await
            .unwrap();
        let entity = ReleaseEntity::stage(f.plan, &failed.setup_node_id);
        let hold = f
            .restraints
            .request_admission(AdmissionRequest::new(restraint.id, "prod", entity.clone()))
            .await
            .unwrap();
        assert!(hold.admitted_now);

        let interrupt = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::Retry).with_node(failed.id))
            .await
            .unwrap();
        assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);

        let old = f.executions.get_node_execution(failed.id).await.unwrap().unwrap();
        assert!(old.old_retry);
        let fresh = f
            .executions
            .find_by_setup_node(f.plan, &failed.setup_node_id)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(fresh.id, failed.id);
        assert_eq!(fresh.status, Status::Queued);
        assert_eq!(node_status(&f, f.stage).await, Status::Running);
        assert_eq!(
            f.restraints
                .get_all_currently_acquired_permits(HoldingScope::Stage, &entity.key(), "prod")
                .await
                .unwrap(),
            0
        );

        // the superseded execution cannot be retried twice
        let err = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::Retry).with_node(failed.id))
            .await
            .unwrap_err();
        assert!(matches!(err, InterruptError::NodeNotEligible { .. }));
    }

    #[tokio::test]
    async fn test_mark_success_overrides_failure() {
        let f = fixture(true).await;
        f.executions
            .update_node_status(f.steps[0], Status::Failed, &[])
            .await
            .unwrap();
        let interrupt = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::MarkSuccess).with_node(f.steps[0]))
            .await
            .unwrap();
        assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);
        assert_eq!(node_status(&f, f.steps[0]).await, Status::Succeeded);

        let err = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::MarkFailed).with_node(f.steps[0]))
            .await
            .unwrap_err();
        assert!(matches!(err, InterruptError::NodeNotEligible { .. }));
    }

    #[tokio::test]
    async fn test_mark_expired_expires_subtree() {
        let f = fixture(true).await;
        let interrupt = f
            .manager
            .register(InterruptPackage::new(f.plan, InterruptType::MarkExpired).with_node(f.stage))
            .await
            .unwrap();
        assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);
        assert_eq!(node_status(&f, f.steps[0]).await, Status::Expired);
        assert_eq!(node_status(&f, f.stage).await, Status::Expired);
        // node scope does not end the plan
        assert_eq!(plan_status(&f).await, Status::Running);
    }

    #[tokio::test]
    async fn test_close_open_for_plan() {
        let f = fixture(false).await;
        f.manager
            .register(InterruptPackage::new(f.plan, InterruptType::AbortAll))
            .await
            .unwrap();
        assert_eq!(f.manager.close_open_for_plan(f.plan).await.unwrap(), 1);
        assert_eq!(f.manager.close_open_for_plan(f.plan).await.unwrap(), 0);
    }
}
