//! Control plane assembly.

use sluice_core::{Clock, SystemClock};
use sluice_interrupt::{
    HandlerContext, HandlerFactory, InterruptManager, InterruptMonitor, LoopbackTerminator, StepTerminator,
};
use sluice_restraint::{ResourceRestraintService, RestraintMonitor, RestraintServiceConfig};
use sluice_runtime::IteratorScheduler;
use sluice_store::{
    ExecutionStore, InMemoryLockProvider, InMemoryNotifyBus, InterruptStore, LockProvider, MemoryExecutionStore,
    MemoryInterruptStore, MemoryRestraintLedger, NotifyBus, RestraintLedger,
};
use std::sync::Arc;
use tracing::info;

use crate::config::{ConfigError, ControlPlaneConfig};
use crate::observer::ExecutionEndObserver;

/// External collaborators of one replica
#[derive(Clone)]
pub struct Collaborators {
    /// Execution store
    pub executions: Arc<dyn ExecutionStore>,
    /// Interrupt collection
    pub interrupts: Arc<dyn InterruptStore>,
    /// Restraint ledger
    pub ledger: Arc<dyn RestraintLedger>,
    /// Distributed locks
    pub locks: Arc<dyn LockProvider>,
    /// Notification bus
    pub bus: Arc<dyn NotifyBus>,
    /// Step executor
    pub terminator: Arc<dyn StepTerminator>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Process-local backends; terminations are acknowledged immediately
    #[must_use]
    pub fn in_memory() -> Self {
        let bus: Arc<dyn NotifyBus> = Arc::new(InMemoryNotifyBus::new());
        Self {
            executions: Arc::new(MemoryExecutionStore::new()),
            interrupts: Arc::new(MemoryInterruptStore::new()),
            ledger: Arc::new(MemoryRestraintLedger::new()),
            locks: Arc::new(InMemoryLockProvider::new()),
            terminator: Arc::new(LoopbackTerminator::new(bus.clone())),
            bus,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the step executor
    #[must_use]
    pub fn with_terminator(mut self, terminator: Arc<dyn StepTerminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Replace the execution store
    #[must_use]
    pub fn with_executions(mut self, executions: Arc<dyn ExecutionStore>) -> Self {
        self.executions = executions;
        self
    }

    /// Replace the time source
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// One replica of the control plane
pub struct ControlPlane {
    config: ControlPlaneConfig,
    collaborators: Collaborators,
    manager: Arc<InterruptManager>,
    restraints: Arc<ResourceRestraintService>,
    observer: Arc<ExecutionEndObserver>,
    interrupt_monitor: Arc<InterruptMonitor>,
    restraint_monitor: Arc<RestraintMonitor>,
    scheduler: IteratorScheduler,
}

impl ControlPlane {
    /// Wire a replica
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: ControlPlaneConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;
        let c = &collaborators;

        let restraints = Arc::new(
            ResourceRestraintService::new(c.ledger.clone(), c.executions.clone(), c.locks.clone())
                .with_clock(c.clock.clone())
                .with_config(RestraintServiceConfig::default().with_lock_timeout(config.restraint_lock_timeout())),
        );
        let ctx = HandlerContext::new(
            c.executions.clone(),
            c.interrupts.clone(),
            c.bus.clone(),
            c.terminator.clone(),
            restraints.clone(),
        )
        .with_clock(c.clock.clone());
        let manager = Arc::new(
            InterruptManager::new(c.interrupts.clone(), c.locks.clone(), HandlerFactory::standard(&ctx))
                .with_clock(c.clock.clone())
                .with_lock_timeout(config.interrupt_lock_timeout()),
        );
        let observer = Arc::new(ExecutionEndObserver::new(manager.clone(), restraints.clone()));
        let interrupt_monitor = Arc::new(InterruptMonitor::new(ctx, config.interrupt_monitor.clone()));
        let restraint_monitor = Arc::new(RestraintMonitor::new(restraints.clone()));

        Ok(Self {
            config,
            collaborators,
            manager,
            restraints,
            observer,
            interrupt_monitor,
            restraint_monitor,
            scheduler: IteratorScheduler::new(),
        })
    }

    /// Interrupt registry
    #[must_use]
    pub fn manager(&self) -> &Arc<InterruptManager> {
        &self.manager
    }

    /// Restraint service
    #[must_use]
    pub fn restraints(&self) -> &Arc<ResourceRestraintService> {
        &self.restraints
    }

    /// End-of-execution observer
    #[must_use]
    pub fn observer(&self) -> &Arc<ExecutionEndObserver> {
        &self.observer
    }

    /// Stuck-interrupt monitor
    #[must_use]
    pub fn interrupt_monitor(&self) -> &Arc<InterruptMonitor> {
        &self.interrupt_monitor
    }

    /// Restraint monitor
    #[must_use]
    pub fn restraint_monitor(&self) -> &Arc<RestraintMonitor> {
        &self.restraint_monitor
    }

    /// Collaborators this replica runs on
    #[must_use]
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Start both background monitors
    ///
    /// Returns the number of monitors started; disabled ones are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if a monitor schedule is invalid
    pub async fn start(&self) -> Result<usize, ConfigError> {
        let mut started = 0;
        if self
            .scheduler
            .register(self.interrupt_monitor.clone(), self.config.interrupt_monitor.iterator.clone())
            .await?
        {
            started += 1;
        }
        if self
            .scheduler
            .register(self.restraint_monitor.clone(), self.config.restraint_monitor.clone())
            .await?
        {
            started += 1;
        }
        info!(monitors = started, "Control plane started");
        Ok(started)
    }

    /// Stop the monitors and wait for in-flight passes
    pub async fn stop(&self) {
        self.scheduler.stop_all().await;
        info!("Control plane stopped");
    }
}
