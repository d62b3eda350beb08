//! Restraint ledger capability.
//!
//! The ledger holds two collections: restraint definitions and the
//! instances (holds and pending requests) drawn against them. The pair
//! (restraint id, order) is unique, which is what serializes concurrent
//! admissions: a writer that loses the race on an order sees
//! [`CoreError::Conflict`] and retries with the next one.

use crate::PageRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::{
    CoreError, CoreResult, HoldingScope, ResourceRestraint, ResourceRestraintInstance, RestraintId,
    RestraintInstanceId, RestraintState,
};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Criteria for selecting restraint instances
///
/// Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    /// Restraint the instance draws from
    pub restraint_id: Option<RestraintId>,
    /// Resource unit
    pub resource_unit: Option<String>,
    /// Holding scope
    pub release_entity_type: Option<HoldingScope>,
    /// Owner keys (any of)
    pub release_entity_ids: Vec<String>,
    /// States (any of)
    pub states: Vec<RestraintState>,
}

impl InstanceFilter {
    /// Match every instance
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one restraint
    #[must_use]
    pub fn restraint(mut self, id: RestraintId) -> Self {
        self.restraint_id = Some(id);
        self
    }

    /// Restrict to one resource unit
    #[must_use]
    pub fn unit(mut self, unit: &str) -> Self {
        self.resource_unit = Some(unit.to_string());
        self
    }

    /// Restrict to one holding scope
    #[must_use]
    pub fn scope(mut self, scope: HoldingScope) -> Self {
        self.release_entity_type = Some(scope);
        self
    }

    /// Restrict to one owner key
    #[must_use]
    pub fn entity(mut self, key: impl Into<String>) -> Self {
        self.release_entity_ids.push(key.into());
        self
    }

    /// Restrict to the given states
    #[must_use]
    pub fn states(mut self, states: &[RestraintState]) -> Self {
        self.states = states.to_vec();
        self
    }

    fn matches(&self, instance: &ResourceRestraintInstance) -> bool {
        self.restraint_id.is_none_or(|id| instance.resource_restraint_id == id)
            && self
                .resource_unit
                .as_deref()
                .is_none_or(|unit| instance.resource_unit == unit)
            && self
                .release_entity_type
                .is_none_or(|scope| instance.release_entity_type == scope)
            && (self.release_entity_ids.is_empty()
                || self.release_entity_ids.contains(&instance.release_entity_id))
            && (self.states.is_empty() || self.states.contains(&instance.state))
    }
}

/// Persisted restraints and their instances
#[async_trait]
pub trait RestraintLedger: Send + Sync {
    /// Insert a restraint; `(account, name)` must be unique
    async fn save_restraint(&self, restraint: ResourceRestraint) -> CoreResult<ResourceRestraint>;

    /// Fetch a restraint
    async fn get_restraint(&self, id: RestraintId) -> CoreResult<Option<ResourceRestraint>>;

    /// Fetch a restraint by account and name
    async fn get_restraint_by_name(&self, account_id: &str, name: &str) -> CoreResult<Option<ResourceRestraint>>;

    /// Delete every restraint of an account together with its instances
    async fn delete_restraints_for_account(&self, account_id: &str) -> CoreResult<usize>;

    /// Insert an instance; `(restraint, order)` must be unique
    async fn insert_instance(&self, instance: ResourceRestraintInstance) -> CoreResult<ResourceRestraintInstance>;

    /// Fetch an instance
    async fn get_instance(&self, id: RestraintInstanceId) -> CoreResult<Option<ResourceRestraintInstance>>;

    /// Highest order used by a restraint, 0 if none
    async fn max_order(&self, restraint_id: RestraintId) -> CoreResult<u64>;

    /// Instances matching a filter, ascending by order
    async fn find_instances(&self, filter: &InstanceFilter) -> CoreResult<Vec<ResourceRestraintInstance>>;

    /// Move an instance to `to` if it is currently `from`
    ///
    /// Sets `acquired_at` to `at` when moving to ACTIVE.
    async fn transition_instance(
        &self,
        id: RestraintInstanceId,
        from: RestraintState,
        to: RestraintState,
        at: DateTime<Utc>,
    ) -> CoreResult<Option<ResourceRestraintInstance>>;

    /// Delete instances by id, returning how many existed
    async fn delete_instances(&self, ids: &[RestraintInstanceId]) -> CoreResult<usize>;

    /// One page of instances in any of `states`, ordered by id
    async fn instances_page(
        &self,
        states: &[RestraintState],
        page: PageRequest<RestraintInstanceId>,
    ) -> CoreResult<Vec<ResourceRestraintInstance>>;
}

#[derive(Default)]
struct LedgerState {
    restraints: HashMap<RestraintId, ResourceRestraint>,
    instances: BTreeMap<RestraintInstanceId, ResourceRestraintInstance>,
}

/// In-memory restraint ledger
#[derive(Default)]
pub struct MemoryRestraintLedger {
    state: RwLock<LedgerState>,
}

impl MemoryRestraintLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RestraintLedger for MemoryRestraintLedger {
    async fn save_restraint(&self, restraint: ResourceRestraint) -> CoreResult<ResourceRestraint> {
        let mut state = self.state.write().await;
        let duplicate = state
            .restraints
            .values()
            .any(|r| r.account_id == restraint.account_id && r.name == restraint.name);
        if duplicate || state.restraints.contains_key(&restraint.id) {
            return Err(CoreError::AlreadyExists {
                kind: "ResourceRestraint".to_string(),
                id: format!("{}/{}", restraint.account_id, restraint.name),
            });
        }
        state.restraints.insert(restraint.id, restraint.clone());
        Ok(restraint)
    }

    async fn get_restraint(&self, id: RestraintId) -> CoreResult<Option<ResourceRestraint>> {
        Ok(self.state.read().await.restraints.get(&id).cloned())
    }

    async fn get_restraint_by_name(&self, account_id: &str, name: &str) -> CoreResult<Option<ResourceRestraint>> {
        Ok(self
            .state
            .read()
            .await
            .restraints
            .values()
            .find(|r| r.account_id == account_id && r.name == name)
            .cloned())
    }

    async fn delete_restraints_for_account(&self, account_id: &str) -> CoreResult<usize> {
        let mut state = self.state.write().await;
        let doomed: Vec<RestraintId> = state
            .restraints
            .values()
            .filter(|r| r.account_id == account_id)
            .map(|r| r.id)
            .collect();
        for id in &doomed {
            state.restraints.remove(id);
        }
        state
            .instances
            .retain(|_, i| !doomed.contains(&i.resource_restraint_id));
        Ok(doomed.len())
    }

    async fn insert_instance(&self, instance: ResourceRestraintInstance) -> CoreResult<ResourceRestraintInstance> {
        let mut state = self.state.write().await;
        let taken = state.instances.values().any(|i| {
            i.resource_restraint_id == instance.resource_restraint_id && i.order == instance.order
        });
        if taken {
            return Err(CoreError::Conflict {
                kind: "ResourceRestraintInstance".to_string(),
                id: format!("{}#{}", instance.resource_restraint_id, instance.order),
            });
        }
        state.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, id: RestraintInstanceId) -> CoreResult<Option<ResourceRestraintInstance>> {
        Ok(self.state.read().await.instances.get(&id).cloned())
    }

    async fn max_order(&self, restraint_id: RestraintId) -> CoreResult<u64> {
        Ok(self
            .state
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.resource_restraint_id == restraint_id)
            .map(|i| i.order)
            .max()
            .unwrap_or(0))
    }

    async fn find_instances(&self, filter: &InstanceFilter) -> CoreResult<Vec<ResourceRestraintInstance>> {
        let state = self.state.read().await;
        let mut found: Vec<ResourceRestraintInstance> = state
            .instances
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        found.sort_by_key(|i| i.order);
        Ok(found)
    }

    async fn transition_instance(
        &self,
        id: RestraintInstanceId,
        from: RestraintState,
        to: RestraintState,
        at: DateTime<Utc>,
    ) -> CoreResult<Option<ResourceRestraintInstance>> {
        let mut state = self.state.write().await;
        let Some(instance) = state.instances.get_mut(&id) else {
            return Ok(None);
        };
        if instance.state != from {
            return Ok(None);
        }
        instance.state = to;
        if to == RestraintState::Active {
            instance.acquired_at = Some(at);
        }
        Ok(Some(instance.clone()))
    }

    async fn delete_instances(&self, ids: &[RestraintInstanceId]) -> CoreResult<usize> {
        let mut state = self.state.write().await;
        Ok(ids
            .iter()
            .filter(|id| state.instances.remove(id).is_some())
            .count())
    }

    async fn instances_page(
        &self,
        states: &[RestraintState],
        page: PageRequest<RestraintInstanceId>,
    ) -> CoreResult<Vec<ResourceRestraintInstance>> {
        let state = self.state.read().await;
        let range = match page.after {
            Some(cursor) => state
                .instances
                .range((std::ops::Bound::Excluded(cursor), std::ops::Bound::Unbounded)),
            None => state.instances.range(..),
        };
        Ok(range
            .map(|(_, i)| i)
            .filter(|i| states.is_empty() || states.contains(&i.state))
            .take(page.limit)
            .cloned()
            .collect())
    }
}
