//! Resource restraint service.
//!
//! Admission and promotion for one `(restraint, resource unit)` pair are
//! serialized by the named lock `RESOURCE_RESTRAINT_<restraintId>_<unit>`.
//! Every state change of an instance is a conditional update on its current
//! state, so repeated or concurrent calls from several replicas are safe.

use chrono::Utc;
use indexmap::IndexSet;
use sluice_core::{
    AcquireMode, Clock, Constraint, CoreError, HoldingScope, ReleaseEntity, ResourceRestraint,
    ResourceRestraintInstance, RestraintId, RestraintInstanceId, RestraintState, Status, Strategy,
    SystemClock,
};
use sluice_store::{
    AcquiredLock, ExecutionStore, InstanceFilter, LockProvider, RestraintLedger, acquire_or_retry_later,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{RestraintError, RestraintResult};

/// Service tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestraintServiceConfig {
    /// How long admission waits for the per-unit lock
    pub lock_timeout: Duration,
    /// Attempts at assigning a fresh order before giving up
    pub max_order_attempts: u32,
}

impl Default for RestraintServiceConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(15),
            max_order_attempts: 5,
        }
    }
}

impl RestraintServiceConfig {
    /// Set the lock timeout
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// A request for permits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Restraint to draw from
    pub restraint_id: RestraintId,
    /// Resource unit
    pub resource_unit: String,
    /// Owner of the hold
    pub release_entity: ReleaseEntity,
    /// Permits requested
    pub permits: u32,
    /// Whether a repeated request reuses the existing hold
    pub acquire_mode: AcquireMode,
    /// Requester, recorded for observability
    pub claimant_id: Option<String>,
}

impl AdmissionRequest {
    /// Request one permit in accumulate mode
    #[must_use]
    pub fn new(restraint_id: RestraintId, resource_unit: &str, release_entity: ReleaseEntity) -> Self {
        Self {
            restraint_id,
            resource_unit: resource_unit.to_string(),
            release_entity,
            permits: 1,
            acquire_mode: AcquireMode::Accumulate,
            claimant_id: None,
        }
    }

    /// Set the permit count
    #[must_use]
    pub fn with_permits(mut self, permits: u32) -> Self {
        self.permits = permits;
        self
    }

    /// Set the acquire mode
    #[must_use]
    pub fn with_mode(mut self, mode: AcquireMode) -> Self {
        self.acquire_mode = mode;
        self
    }

    /// Record the requester
    #[must_use]
    pub fn with_claimant(mut self, claimant_id: &str) -> Self {
        self.claimant_id = Some(claimant_id.to_string());
        self
    }
}

/// Result of an admission request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionOutcome {
    /// The hold, new or reused
    pub instance: ResourceRestraintInstance,
    /// Whether permits were granted on creation
    pub admitted_now: bool,
    /// Whether an existing hold was returned under ENSURE
    pub reused: bool,
}

/// Admission control over the restraint ledger
pub struct ResourceRestraintService {
    ledger: Arc<dyn RestraintLedger>,
    executions: Arc<dyn ExecutionStore>,
    locks: Arc<dyn LockProvider>,
    clock: Arc<dyn Clock>,
    config: RestraintServiceConfig,
}

/// Name of the lock serializing admissions on one resource unit
#[must_use]
pub fn restraint_lock_name(restraint_id: RestraintId, unit: &str) -> String {
    format!("RESOURCE_RESTRAINT_{}_{}", restraint_id, unit)
}

fn not_activatable(id: RestraintInstanceId, state: RestraintState) -> RestraintError {
    CoreError::InvalidTransition {
        kind: "ResourceRestraintInstance".to_string(),
        id: id.to_string(),
        from: state.to_string(),
        to: RestraintState::Active.to_string(),
    }
    .into()
}

fn active_permits(instances: &[ResourceRestraintInstance]) -> u32 {
    instances
        .iter()
        .filter(|i| i.state == RestraintState::Active)
        .map(|i| i.permits)
        .sum()
}

impl ResourceRestraintService {
    /// Create a service over the given collaborators
    #[must_use]
    pub fn new(
        ledger: Arc<dyn RestraintLedger>,
        executions: Arc<dyn ExecutionStore>,
        locks: Arc<dyn LockProvider>,
    ) -> Self {
        Self {
            ledger,
            executions,
            locks,
            clock: Arc::new(SystemClock),
            config: RestraintServiceConfig::default(),
        }
    }

    /// Use a specific clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a specific configuration
    #[must_use]
    pub fn with_config(mut self, config: RestraintServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// The ledger this service operates on
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn RestraintLedger> {
        &self.ledger
    }

    async fn lock_unit(&self, restraint_id: RestraintId, unit: &str) -> RestraintResult<AcquiredLock> {
        let name = restraint_lock_name(restraint_id, unit);
        Ok(acquire_or_retry_later(self.locks.as_ref(), &name, self.config.lock_timeout).await?)
    }

    /// Define a new restraint
    ///
    /// # Errors
    ///
    /// Returns error on zero capacity, an empty name or a duplicate name in the account
    pub async fn create_restraint(
        &self,
        account_id: &str,
        name: &str,
        capacity: u32,
        strategy: Strategy,
    ) -> RestraintResult<ResourceRestraint> {
        if capacity == 0 {
            return Err(RestraintError::ZeroCapacity);
        }
        if name.trim().is_empty() {
            return Err(CoreError::validation("name", "restraint name must not be empty").into());
        }
        let restraint = ResourceRestraint {
            id: RestraintId::new(),
            account_id: account_id.to_string(),
            name: name.to_string(),
            capacity,
            strategy,
            created_at: self.clock.now(),
        };
        let saved = self.ledger.save_restraint(restraint).await?;
        info!(restraint_id = %saved.id, account_id, name, capacity, "Resource restraint created");
        Ok(saved)
    }

    /// Look up a restraint by account and name
    ///
    /// # Errors
    ///
    /// Returns error if the ledger fails
    pub async fn get_by_name(&self, account_id: &str, name: &str) -> RestraintResult<Option<ResourceRestraint>> {
        Ok(self.ledger.get_restraint_by_name(account_id, name).await?)
    }

    /// Delete every restraint of an account, with their instances
    ///
    /// # Errors
    ///
    /// Returns error if the ledger fails
    pub async fn delete_for_account(&self, account_id: &str) -> RestraintResult<usize> {
        let deleted = self.ledger.delete_restraints_for_account(account_id).await?;
        info!(account_id, deleted, "Resource restraints deleted");
        Ok(deleted)
    }

    /// Admission view of a restraint
    #[must_use]
    pub fn create_abstraction(&self, restraint: &ResourceRestraint) -> Constraint {
        Constraint::from(restraint)
    }

    /// Request permits
    ///
    /// The new instance is ACTIVE if the permits fit the unit's free capacity
    /// and, under FIFO, nobody is already waiting on that unit. Otherwise it
    /// is BLOCKED until promoted.
    ///
    /// # Errors
    ///
    /// Returns error on an unknown restraint, an impossible permit count, lock
    /// contention, or if no order could be assigned
    pub async fn request_admission(&self, request: AdmissionRequest) -> RestraintResult<AdmissionOutcome> {
        let restraint = self
            .ledger
            .get_restraint(request.restraint_id)
            .await?
            .ok_or(RestraintError::RestraintNotFound(request.restraint_id))?;
        if request.permits == 0 || request.permits > restraint.capacity {
            return Err(RestraintError::InvalidPermits {
                requested: request.permits,
                capacity: restraint.capacity,
            });
        }

        let _lock = self.lock_unit(restraint.id, &request.resource_unit).await?;
        let entity_key = request.release_entity.key();

        if request.acquire_mode == AcquireMode::Ensure {
            let existing = self
                .ledger
                .find_instances(
                    &InstanceFilter::new()
                        .restraint(restraint.id)
                        .unit(&request.resource_unit)
                        .scope(request.release_entity.scope())
                        .entity(entity_key.clone())
                        .states(&[RestraintState::Blocked, RestraintState::Active]),
                )
                .await?;
            if let Some(instance) = existing.into_iter().next() {
                debug!(
                    instance_id = %instance.id,
                    release_entity_id = %entity_key,
                    "Reusing existing hold"
                );
                let admitted_now = instance.state == RestraintState::Active;
                return Ok(AdmissionOutcome {
                    instance,
                    admitted_now,
                    reused: true,
                });
            }
        }

        let open = self
            .ledger
            .find_instances(
                &InstanceFilter::new()
                    .restraint(restraint.id)
                    .unit(&request.resource_unit)
                    .states(&[RestraintState::Blocked, RestraintState::Active]),
            )
            .await?;
        let acquired = active_permits(&open);
        let someone_waiting = open.iter().any(|i| i.state == RestraintState::Blocked);
        let fits = acquired + request.permits <= restraint.capacity;
        let admit = match restraint.strategy {
            Strategy::Asap => fits,
            Strategy::Fifo => fits && !someone_waiting,
        };

        let now = self.clock.now();
        for _ in 0..self.config.max_order_attempts {
            let order = self.ledger.max_order(restraint.id).await? + 1;
            let instance = ResourceRestraintInstance {
                id: RestraintInstanceId::new(),
                resource_restraint_id: restraint.id,
                resource_unit: request.resource_unit.clone(),
                release_entity_type: request.release_entity.scope(),
                release_entity_id: entity_key.clone(),
                claimant_id: request.claimant_id.clone(),
                order,
                permits: request.permits,
                state: if admit {
                    RestraintState::Active
                } else {
                    RestraintState::Blocked
                },
                created_at: now,
                acquired_at: admit.then_some(now),
            };
            match self.ledger.insert_instance(instance).await {
                Ok(instance) => {
                    debug!(
                        restraint_id = %restraint.id,
                        instance_id = %instance.id,
                        unit = %instance.resource_unit,
                        order,
                        permits = instance.permits,
                        acquired,
                        state = %instance.state,
                        "Admission recorded"
                    );
                    return Ok(AdmissionOutcome {
                        instance,
                        admitted_now: admit,
                        reused: false,
                    });
                }
                Err(CoreError::Conflict { .. }) => {
                    debug!(restraint_id = %restraint.id, order, "Order taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(RestraintError::OrderContention {
            restraint_id: restraint.id,
            attempts: self.config.max_order_attempts,
        })
    }

    /// Promote a BLOCKED instance to ACTIVE
    ///
    /// The promotion runs under the unit lock and only happens when the
    /// instance fits the remaining capacity and, under FIFO, no older
    /// instance is still waiting on the unit.
    ///
    /// # Errors
    ///
    /// Returns [`RestraintError::InstanceNotFound`] if the id is unknown,
    /// [`RestraintError::NotAdmissible`] if the instance does not fit yet, and
    /// an invalid-transition error if the instance is already FINISHED
    pub async fn activate_blocked_instance(
        &self,
        id: RestraintInstanceId,
        resource_unit: &str,
    ) -> RestraintResult<ResourceRestraintInstance> {
        let current = self
            .ledger
            .get_instance(id)
            .await?
            .ok_or(RestraintError::InstanceNotFound(id))?;
        match current.state {
            RestraintState::Active => return Ok(current),
            RestraintState::Finished => return Err(not_activatable(id, current.state)),
            RestraintState::Blocked => {}
        }
        let restraint = self
            .ledger
            .get_restraint(current.resource_restraint_id)
            .await?
            .ok_or(RestraintError::RestraintNotFound(current.resource_restraint_id))?;

        let _lock = self.lock_unit(restraint.id, &current.resource_unit).await?;
        let open = self
            .ledger
            .find_instances(
                &InstanceFilter::new()
                    .restraint(restraint.id)
                    .unit(&current.resource_unit)
                    .states(&[RestraintState::Blocked, RestraintState::Active]),
            )
            .await?;
        let Some(latest) = open.iter().find(|i| i.id == id) else {
            let latest = self.ledger.get_instance(id).await?.unwrap_or(current);
            return Err(not_activatable(id, latest.state));
        };
        if latest.state == RestraintState::Active {
            return Ok(latest.clone());
        }

        let acquired = active_permits(&open);
        let ahead = match restraint.strategy {
            Strategy::Fifo => open
                .iter()
                .filter(|i| i.state == RestraintState::Blocked && i.order < latest.order)
                .count(),
            Strategy::Asap => 0,
        };
        if acquired + latest.permits > restraint.capacity || ahead > 0 {
            debug!(
                instance_id = %id,
                unit = resource_unit,
                acquired,
                capacity = restraint.capacity,
                ahead,
                "Instance does not fit yet"
            );
            return Err(RestraintError::NotAdmissible {
                id,
                acquired,
                requested: latest.permits,
                capacity: restraint.capacity,
                ahead,
            });
        }

        let moved = self
            .ledger
            .transition_instance(id, RestraintState::Blocked, RestraintState::Active, self.clock.now())
            .await?;
        match moved {
            Some(instance) => {
                debug!(instance_id = %id, unit = resource_unit, order = instance.order, "Instance activated");
                Ok(instance)
            }
            None => {
                let latest = self.ledger.get_instance(id).await?.unwrap_or(current);
                match latest.state {
                    RestraintState::Active => Ok(latest),
                    state => Err(not_activatable(id, state)),
                }
            }
        }
    }

    /// Release an ACTIVE instance
    ///
    /// Returns `Ok(None)` if the id is unknown or the instance is not ACTIVE.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger fails
    pub async fn finish_instance(
        &self,
        id: RestraintInstanceId,
        resource_unit: &str,
    ) -> RestraintResult<Option<ResourceRestraintInstance>> {
        let finished = self
            .ledger
            .transition_instance(id, RestraintState::Active, RestraintState::Finished, self.clock.now())
            .await?;
        match &finished {
            Some(instance) => {
                debug!(instance_id = %id, unit = resource_unit, permits = instance.permits, "Instance finished")
            }
            None => debug!(instance_id = %id, unit = resource_unit, "Nothing to finish"),
        }
        Ok(finished)
    }

    /// Sum of permits held by an entity on a unit, across restraints
    ///
    /// # Errors
    ///
    /// Returns error if the ledger fails
    pub async fn get_all_currently_acquired_permits(
        &self,
        scope: HoldingScope,
        release_entity_id: &str,
        resource_unit: &str,
    ) -> RestraintResult<u32> {
        let active = self
            .ledger
            .find_instances(
                &InstanceFilter::new()
                    .scope(scope)
                    .entity(release_entity_id)
                    .unit(resource_unit)
                    .states(&[RestraintState::Active]),
            )
            .await?;
        Ok(active_permits(&active))
    }

    /// Finish an ACTIVE instance whose owner has reached a final status
    ///
    /// Returns true when the owner is final and the instance was released.
    /// Owner lookup failures are logged and reported as no progress.
    pub async fn update_active_constraints_for_instance(&self, instance: &ResourceRestraintInstance) -> bool {
        let entity = match instance.release_entity() {
            Ok(entity) => entity,
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Malformed release entity");
                return false;
            }
        };

        let owner_status = match &entity {
            ReleaseEntity::Pipeline { plan_execution_id } => {
                self.executions.get_plan_execution_status(*plan_execution_id).await
            }
            ReleaseEntity::Stage {
                plan_execution_id,
                setup_node_id,
            } => self
                .executions
                .find_by_setup_node(*plan_execution_id, setup_node_id)
                .await
                .map(|node| node.map(|n| n.status)),
        };

        let status: Status = match owner_status {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(
                    instance_id = %instance.id,
                    release_entity_id = %instance.release_entity_id,
                    "Owner of hold not found, will retry"
                );
                return false;
            }
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Owner lookup failed, will retry");
                return false;
            }
        };

        if !status.is_final() {
            return false;
        }
        match self.finish_instance(instance.id, &instance.resource_unit).await {
            Ok(_) => {
                info!(
                    instance_id = %instance.id,
                    release_entity_id = %instance.release_entity_id,
                    owner_status = %status,
                    "Released hold of finished owner"
                );
                true
            }
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Failed to release hold");
                false
            }
        }
    }

    /// Promote BLOCKED instances of the given restraints that now fit
    ///
    /// Returns the number of promoted instances.
    ///
    /// # Errors
    ///
    /// Returns error on lock contention or ledger failure
    pub async fn update_blocked_constraints(&self, restraint_ids: &[RestraintId]) -> RestraintResult<usize> {
        let mut promoted = 0;
        let distinct: IndexSet<RestraintId> = restraint_ids.iter().copied().collect();
        for restraint_id in distinct {
            let Some(restraint) = self.ledger.get_restraint(restraint_id).await? else {
                warn!(restraint_id = %restraint_id, "Restraint vanished, skipping promotion");
                continue;
            };
            let blocked = self
                .ledger
                .find_instances(
                    &InstanceFilter::new()
                        .restraint(restraint_id)
                        .states(&[RestraintState::Blocked]),
                )
                .await?;
            let units: IndexSet<String> = blocked.into_iter().map(|i| i.resource_unit).collect();
            for unit in units {
                promoted += self.promote_unit(&restraint, &unit).await?;
            }
        }
        Ok(promoted)
    }

    async fn promote_unit(&self, restraint: &ResourceRestraint, unit: &str) -> RestraintResult<usize> {
        let _lock = self.lock_unit(restraint.id, unit).await?;
        let open = self
            .ledger
            .find_instances(
                &InstanceFilter::new()
                    .restraint(restraint.id)
                    .unit(unit)
                    .states(&[RestraintState::Blocked, RestraintState::Active]),
            )
            .await?;
        let mut acquired = active_permits(&open);
        let mut promoted = 0;
        for waiting in open.iter().filter(|i| i.state == RestraintState::Blocked) {
            if acquired + waiting.permits > restraint.capacity {
                match restraint.strategy {
                    Strategy::Fifo => break,
                    Strategy::Asap => continue,
                }
            }
            let moved = self
                .ledger
                .transition_instance(
                    waiting.id,
                    RestraintState::Blocked,
                    RestraintState::Active,
                    self.clock.now(),
                )
                .await?;
            if moved.is_some() {
                acquired += waiting.permits;
                promoted += 1;
                debug!(
                    restraint_id = %restraint.id,
                    instance_id = %waiting.id,
                    unit,
                    order = waiting.order,
                    acquired,
                    capacity = restraint.capacity,
                    "Blocked instance promoted"
                );
            }
        }
        Ok(promoted)
    }

    /// Reconcile one instance against the state of its owner
    ///
    /// BLOCKED instances trigger a promotion scan of their restraint; ACTIVE
    /// instances are finished if their owner is final, and only then is a
    /// promotion scan run.
    ///
    /// # Errors
    ///
    /// Returns error on lock contention or ledger failure during promotion
    pub async fn process_restraint(&self, instance: &ResourceRestraintInstance) -> RestraintResult<()> {
        match instance.state {
            RestraintState::Blocked => {
                self.update_blocked_constraints(&[instance.resource_restraint_id]).await?;
            }
            RestraintState::Active => {
                if self.update_active_constraints_for_instance(instance).await {
                    self.update_blocked_constraints(&[instance.resource_restraint_id]).await?;
                }
            }
            RestraintState::Finished => {}
        }
        Ok(())
    }

    /// Remove open holds of entities that are being deleted or retried
    ///
    /// Freed capacity is handed to waiting instances right away when the unit
    /// lock is free; otherwise the promotion is left to the restraint monitor.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger fails
    pub async fn delete_instances_for_given_release_type(
        &self,
        release_entity_ids: &[String],
        scope: HoldingScope,
    ) -> RestraintResult<usize> {
        if release_entity_ids.is_empty() {
            return Ok(0);
        }
        let mut filter = InstanceFilter::new()
            .scope(scope)
            .states(&[RestraintState::Active, RestraintState::Blocked]);
        filter.release_entity_ids = release_entity_ids.to_vec();
        let doomed = self.ledger.find_instances(&filter).await?;
        if doomed.is_empty() {
            return Ok(0);
        }
        let ids: Vec<RestraintInstanceId> = doomed.iter().map(|i| i.id).collect();
        let restraints: Vec<RestraintId> = doomed.iter().map(|i| i.resource_restraint_id).collect();
        let deleted = self.ledger.delete_instances(&ids).await?;
        info!(scope = %scope, deleted, "Deleted holds of released entities");
        if let Err(e) = self.update_blocked_constraints(&restraints).await {
            // the restraint monitor promotes the waiters on its next pass
            warn!(scope = %scope, error = %e, "Deferred promotion after deleting holds");
        }
        Ok(deleted)
    }

    /// Finish every ACTIVE hold of an entity and promote waiters
    ///
    /// Returns the number of holds released.
    ///
    /// # Errors
    ///
    /// Returns error on lock contention or ledger failure
    pub async fn release_holds(&self, scope: HoldingScope, release_entity_id: &str) -> RestraintResult<usize> {
        let active = self
            .ledger
            .find_instances(
                &InstanceFilter::new()
                    .scope(scope)
                    .entity(release_entity_id)
                    .states(&[RestraintState::Active]),
            )
            .await?;
        let mut released = 0;
        let mut restraints = Vec::new();
        for instance in &active {
            if self.finish_instance(instance.id, &instance.resource_unit).await?.is_some() {
                released += 1;
                restraints.push(instance.resource_restraint_id);
            }
        }
        if !restraints.is_empty() {
            self.update_blocked_constraints(&restraints).await?;
        }
        Ok(released)
    }

    /// Current time according to the service clock
    #[must_use]
    pub fn now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{Just, ProptestConfig, any, prop_oneof};
    use proptest::strategy::Strategy as PropStrategy;
    use sluice_core::{ExecutionMode, NodeExecution, PlanExecution, PlanExecutionId};
    use sluice_store::{InMemoryLockProvider, MemoryExecutionStore, MemoryRestraintLedger};

    struct Fixture {
        service: ResourceRestraintService,
        executions: Arc<MemoryExecutionStore>,
        ledger: Arc<MemoryRestraintLedger>,
    }

    fn fixture() -> Fixture {
        let executions = Arc::new(MemoryExecutionStore::new());
        let ledger = Arc::new(MemoryRestraintLedger::new());
        let service = ResourceRestraintService::new(
            ledger.clone(),
            executions.clone(),
            Arc::new(InMemoryLockProvider::new()),
        );
        Fixture {
            service,
            executions,
            ledger,
        }
    }

    async fn running_plan(f: &Fixture) -> PlanExecutionId {
        let plan = PlanExecution::new(PlanExecutionId::new(), Utc::now());
        let id = plan.id;
        f.executions.save_plan_execution(plan).await.unwrap();
        id
    }

    async fn state_of(f: &Fixture, id: RestraintInstanceId) -> RestraintState {
        f.ledger.get_instance(id).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn test_db_lock_release_promotes_next() {
        let f = fixture();
        let restraint = f
            .service
            .create_restraint("acc", "db-lock", 1, Strategy::Fifo)
            .await
            .unwrap();
        let plan_a = running_plan(&f).await;
        let plan_b = running_plan(&f).await;

        let a = f
            .service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", ReleaseEntity::pipeline(plan_a)))
            .await
            .unwrap();
        let b = f
            .service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", ReleaseEntity::pipeline(plan_b)))
            .await
            .unwrap();
        assert!(a.admitted_now);
        assert_eq!(a.instance.order, 1);
        assert!(!b.admitted_now);
        assert_eq!(b.instance.order, 2);

        f.executions
            .update_plan_status(plan_a, Status::Succeeded, &[])
            .await
            .unwrap();
        f.service.process_restraint(&a.instance).await.unwrap();

        assert_eq!(state_of(&f, a.instance.id).await, RestraintState::Finished);
        assert_eq!(state_of(&f, b.instance.id).await, RestraintState::Active);
        let held = f
            .service
            .get_all_currently_acquired_permits(HoldingScope::Pipeline, &plan_b.to_string(), "prod")
            .await
            .unwrap();
        assert_eq!(held, 1);
    }

    #[tokio::test]
    async fn test_permits_counted_per_unit() {
        let f = fixture();
        let restraint = f
            .service
            .create_restraint("acc", "envs", 5, Strategy::Asap)
            .await
            .unwrap();
        let plan = running_plan(&f).await;
        let entity = ReleaseEntity::pipeline(plan);
        for unit in ["keyA", "keyA", "keyB"] {
            f.service
                .request_admission(AdmissionRequest::new(restraint.id, unit, entity.clone()))
                .await
                .unwrap();
        }

        let key = entity.key();
        let on_b = f
            .service
            .get_all_currently_acquired_permits(HoldingScope::Pipeline, &key, "keyB")
            .await
            .unwrap();
        let on_a = f
            .service
            .get_all_currently_acquired_permits(HoldingScope::Pipeline, &key, "keyA")
            .await
            .unwrap();
        assert_eq!(on_b, 1);
        assert_eq!(on_a, 2);
    }

    #[tokio::test]
    async fn test_unknown_ids_activate_errors_finish_noops() {
        let f = fixture();
        let unknown = RestraintInstanceId::new();
        let err = f
            .service
            .activate_blocked_instance(unknown, "prod")
            .await
            .unwrap_err();
        assert_eq!(err, RestraintError::InstanceNotFound(unknown));
        assert!(f.service.finish_instance(unknown, "prod").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_is_idempotent() {
        let f = fixture();
        let restraint = f
            .service
            .create_restraint("acc", "db", 1, Strategy::Fifo)
            .await
            .unwrap();
        let plan = running_plan(&f).await;
        let held = f
            .service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", ReleaseEntity::pipeline(plan)))
            .await
            .unwrap();

        let first = f.service.finish_instance(held.instance.id, "prod").await.unwrap();
        let second = f.service.finish_instance(held.instance.id, "prod").await.unwrap();
        assert_eq!(first.unwrap().state, RestraintState::Finished);
        assert!(second.is_none());
        assert_eq!(state_of(&f, held.instance.id).await, RestraintState::Finished);
    }

    #[tokio::test]
    async fn test_activate_refuses_past_capacity() {
        let f = fixture();
        let restraint = f
            .service
            .create_restraint("acc", "db-lock", 1, Strategy::Fifo)
            .await
            .unwrap();
        let plan_a = running_plan(&f).await;
        let plan_b = running_plan(&f).await;
        let holder = f
            .service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", ReleaseEntity::pipeline(plan_a)))
            .await
            .unwrap();
        let waiting = f
            .service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", ReleaseEntity::pipeline(plan_b)))
            .await
            .unwrap();

        let err = f
            .service
            .activate_blocked_instance(waiting.instance.id, "prod")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RestraintError::NotAdmissible {
                acquired: 1,
                requested: 1,
                capacity: 1,
                ..
            }
        ));
        assert!(!err.is_retryable());
        assert_eq!(state_of(&f, waiting.instance.id).await, RestraintState::Blocked);
        let open = f
            .ledger
            .find_instances(
                &InstanceFilter::new()
                    .restraint(restraint.id)
                    .unit("prod")
                    .states(&[RestraintState::Active]),
            )
            .await
            .unwrap();
        assert_eq!(active_permits(&open), 1);

        f.service.finish_instance(holder.instance.id, "prod").await.unwrap();
        let once = f
            .service
            .activate_blocked_instance(waiting.instance.id, "prod")
            .await
            .unwrap();
        let twice = f
            .service
            .activate_blocked_instance(waiting.instance.id, "prod")
            .await
            .unwrap();
        assert_eq!(once.state, RestraintState::Active);
        assert_eq!(twice.id, once.id);

        f.service.finish_instance(waiting.instance.id, "prod").await.unwrap();
        let err = f
            .service
            .activate_blocked_instance(waiting.instance.id, "prod")
            .await
            .unwrap_err();
        assert!(matches!(err, RestraintError::Core(CoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_activate_respects_fifo_head() {
        let f = fixture();
        let restraint = f
            .service
            .create_restraint("acc", "pool", 2, Strategy::Fifo)
            .await
            .unwrap();
        let plan = running_plan(&f).await;
        let entity = ReleaseEntity::pipeline(plan);
        let holder = f
            .service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", entity.clone()).with_permits(2))
            .await
            .unwrap();
        let big = f
            .service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", entity.clone()).with_permits(2))
            .await
            .unwrap();
        let small = f
            .service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", entity))
            .await
            .unwrap();
        f.service.finish_instance(holder.instance.id, "prod").await.unwrap();

        let err = f
            .service
            .activate_blocked_instance(small.instance.id, "prod")
            .await
            .unwrap_err();
        assert!(matches!(err, RestraintError::NotAdmissible { ahead: 1, .. }));
        assert_eq!(state_of(&f, small.instance.id).await, RestraintState::Blocked);

        let head = f
            .service
            .activate_blocked_instance(big.instance.id, "prod")
            .await
            .unwrap();
        assert_eq!(head.state, RestraintState::Active);
    }

    #[tokio::test]
    async fn test_fifo_does_not_jump_queue_asap_does() {
        for (strategy, expect_small_admitted) in [(Strategy::Fifo, false), (Strategy::Asap, true)] {
            let f = fixture();
            let restraint = f
                .service
                .create_restraint("acc", "pool", 3, strategy)
                .await
                .unwrap();
            let plan = running_plan(&f).await;
            let entity = ReleaseEntity::pipeline(plan);

            let holder = f
                .service
                .request_admission(AdmissionRequest::new(restraint.id, "u", entity.clone()).with_permits(2))
                .await
                .unwrap();
            let big = f
                .service
                .request_admission(AdmissionRequest::new(restraint.id, "u", entity.clone()).with_permits(2))
                .await
                .unwrap();
            let small = f
                .service
                .request_admission(AdmissionRequest::new(restraint.id, "u", entity.clone()).with_permits(1))
                .await
                .unwrap();

            assert!(holder.admitted_now);
            assert!(!big.admitted_now);
            assert_eq!(small.admitted_now, expect_small_admitted, "{:?}", strategy);

            f.service.update_blocked_constraints(&[restraint.id]).await.unwrap();
            assert_eq!(state_of(&f, big.instance.id).await, RestraintState::Blocked);
        }
    }

    #[tokio::test]
    async fn test_ensure_reuses_existing_hold() {
        let f = fixture();
        let restraint = f
            .service
            .create_restraint("acc", "db", 2, Strategy::Fifo)
            .await
            .unwrap();
        let plan = running_plan(&f).await;
        let request = AdmissionRequest::new(restraint.id, "prod", ReleaseEntity::stage(plan, "deploy"))
            .with_mode(AcquireMode::Ensure)
            .with_claimant("deploy-step");

        let first = f.service.request_admission(request.clone()).await.unwrap();
        let second = f.service.request_admission(request).await.unwrap();
        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.instance.id, second.instance.id);
        assert_eq!(first.instance.claimant_id.as_deref(), Some("deploy-step"));
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let f = fixture();
        assert_eq!(
            f.service
                .create_restraint("acc", "db", 0, Strategy::Fifo)
                .await
                .unwrap_err(),
            RestraintError::ZeroCapacity
        );
        let restraint = f
            .service
            .create_restraint("acc", "db", 1, Strategy::Fifo)
            .await
            .unwrap();
        assert!(f.service.create_restraint("acc", "db", 1, Strategy::Fifo).await.is_err());

        let plan = running_plan(&f).await;
        let err = f
            .service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", ReleaseEntity::pipeline(plan)).with_permits(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RestraintError::InvalidPermits { requested: 2, capacity: 1 }));

        let unknown = RestraintId::new();
        let err = f
            .service
            .request_admission(AdmissionRequest::new(unknown, "prod", ReleaseEntity::pipeline(plan)))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stage_hold_released_when_stage_final() {
        let f = fixture();
        let restraint = f
            .service
            .create_restraint("acc", "db", 1, Strategy::Fifo)
            .await
            .unwrap();
        let plan = running_plan(&f).await;
        let stage = NodeExecution::new(plan, "deploy", None, ExecutionMode::Child, Utc::now());
        f.executions.save_node_execution(stage.clone()).await.unwrap();

        let held = f
            .service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", ReleaseEntity::stage(plan, "deploy")))
            .await
            .unwrap();
        assert!(!f.service.update_active_constraints_for_instance(&held.instance).await);

        f.executions
            .update_node_status(stage.id, Status::Failed, &[])
            .await
            .unwrap();
        assert!(f.service.update_active_constraints_for_instance(&held.instance).await);
        assert_eq!(state_of(&f, held.instance.id).await, RestraintState::Finished);
    }

    #[tokio::test]
    async fn test_lookup_failure_reports_no_progress() {
        let f = fixture();
        let restraint = f
            .service
            .create_restraint("acc", "db", 1, Strategy::Fifo)
            .await
            .unwrap();
        let plan = running_plan(&f).await;
        let held = f
            .service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", ReleaseEntity::pipeline(plan)))
            .await
            .unwrap();
        f.executions
            .update_plan_status(plan, Status::Succeeded, &[])
            .await
            .unwrap();

        f.executions.set_unavailable(true);
        assert!(!f.service.update_active_constraints_for_instance(&held.instance).await);
        assert_eq!(state_of(&f, held.instance.id).await, RestraintState::Active);

        f.executions.set_unavailable(false);
        assert!(f.service.update_active_constraints_for_instance(&held.instance).await);
    }

    #[tokio::test]
    async fn test_delete_for_release_type_frees_capacity() {
        let f = fixture();
        let restraint = f
            .service
            .create_restraint("acc", "db", 1, Strategy::Fifo)
            .await
            .unwrap();
        let plan_a = running_plan(&f).await;
        let plan_b = running_plan(&f).await;
        let a_entity = ReleaseEntity::stage(plan_a, "deploy");
        f.service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", a_entity.clone()))
            .await
            .unwrap();
        let b = f
            .service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", ReleaseEntity::pipeline(plan_b)))
            .await
            .unwrap();
        assert!(!b.admitted_now);

        let deleted = f
            .service
            .delete_instances_for_given_release_type(&[a_entity.key()], HoldingScope::Stage)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(state_of(&f, b.instance.id).await, RestraintState::Active);
    }

    #[tokio::test]
    async fn test_release_holds_finishes_entity_holds() {
        let f = fixture();
        let restraint = f
            .service
            .create_restraint("acc", "db", 1, Strategy::Fifo)
            .await
            .unwrap();
        let plan = running_plan(&f).await;
        let other = running_plan(&f).await;
        f.service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", ReleaseEntity::pipeline(plan)))
            .await
            .unwrap();
        let waiting = f
            .service
            .request_admission(AdmissionRequest::new(restraint.id, "prod", ReleaseEntity::pipeline(other)))
            .await
            .unwrap();

        let released = f
            .service
            .release_holds(HoldingScope::Pipeline, &plan.to_string())
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert_eq!(state_of(&f, waiting.instance.id).await, RestraintState::Active);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Request { unit: usize, permits: u32 },
        FinishOldest { unit: usize },
        Promote,
    }

    fn op() -> impl PropStrategy<Value = Op> {
        prop_oneof![
            (0..2usize, 1..=3u32).prop_map(|(unit, permits)| Op::Request { unit, permits }),
            (0..2usize).prop_map(|unit| Op::FinishOldest { unit }),
            Just(Op::Promote),
        ]
    }

    proptest::proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_active_permits_never_exceed_capacity(
            ops in proptest::collection::vec(op(), 1..40),
            fifo in any::<bool>(),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let f = fixture();
                let strategy = if fifo { Strategy::Fifo } else { Strategy::Asap };
                let restraint = f.service.create_restraint("acc", "pool", 3, strategy).await.unwrap();
                let plan = running_plan(&f).await;
                let units = ["u0", "u1"];

                for op in ops {
                    match op {
                        Op::Request { unit, permits } => {
                            f.service
                                .request_admission(
                                    AdmissionRequest::new(restraint.id, units[unit], ReleaseEntity::pipeline(plan))
                                        .with_permits(permits),
                                )
                                .await
                                .unwrap();
                        }
                        Op::FinishOldest { unit } => {
                            let active = f
                                .ledger
                                .find_instances(
                                    &InstanceFilter::new()
                                        .unit(units[unit])
                                        .states(&[RestraintState::Active]),
                                )
                                .await
                                .unwrap();
                            if let Some(oldest) = active.first() {
                                f.service.finish_instance(oldest.id, units[unit]).await.unwrap();
                            }
                        }
                        Op::Promote => {
                            f.service.update_blocked_constraints(&[restraint.id]).await.unwrap();
                        }
                    }

                    for unit in units {
                        let active = f
                            .ledger
                            .find_instances(
                                &InstanceFilter::new().unit(unit).states(&[RestraintState::Active]),
                            )
                            .await
                            .unwrap();
                        assert!(active_permits(&active) <= restraint.capacity);
                    }
                }
            });
        }
    }
}
