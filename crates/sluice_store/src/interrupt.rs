//! Interrupt collection capability.

use crate::PageRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::{
    CoreError, CoreResult, Interrupt, InterruptId, InterruptState, InterruptType, PlanExecutionId,
};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Selection of interrupts the stuck-interrupt monitor looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckInterruptQuery {
    /// Interrupt types to consider
    pub types: Vec<InterruptType>,
    /// State the interrupt must be in
    pub state: InterruptState,
    /// Only interrupts created strictly before this instant
    pub created_before: DateTime<Utc>,
    /// Skip interrupts whose `next_iteration` lies after this instant
    pub due_at: DateTime<Utc>,
}

impl StuckInterruptQuery {
    fn matches(&self, interrupt: &Interrupt) -> bool {
        self.types.contains(&interrupt.interrupt_type)
            && interrupt.state == self.state
            && interrupt.created_at < self.created_before
            && interrupt.next_iteration.is_none_or(|next| next <= self.due_at)
    }
}

/// Persisted interrupts
#[async_trait]
pub trait InterruptStore: Send + Sync {
    /// Insert a new interrupt
    async fn save(&self, interrupt: Interrupt) -> CoreResult<Interrupt>;

    /// Fetch an interrupt
    async fn get(&self, id: InterruptId) -> CoreResult<Option<Interrupt>>;

    /// Move an interrupt to `to` if its state is one of `from`
    ///
    /// Returns `Ok(None)` when the interrupt is missing or in another state,
    /// and an invalid-transition error when `to` would move it backwards or
    /// out of a terminal state.
    async fn transition(
        &self,
        id: InterruptId,
        from: &[InterruptState],
        to: InterruptState,
    ) -> CoreResult<Option<Interrupt>>;

    /// Interrupts of a plan in any of `states` (all states if empty)
    async fn find_by_plan(
        &self,
        plan_execution_id: PlanExecutionId,
        states: &[InterruptState],
    ) -> CoreResult<Vec<Interrupt>>;

    /// One page of stuck candidates, ordered by id
    async fn find_stuck(
        &self,
        query: &StuckInterruptQuery,
        page: PageRequest<InterruptId>,
    ) -> CoreResult<Vec<Interrupt>>;

    /// Claim an interrupt for one monitor iteration
    ///
    /// Succeeds only if `next_iteration` still equals `expected`, so that two
    /// replicas never work on the same interrupt in the same cycle.
    async fn claim_iteration(
        &self,
        id: InterruptId,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
    ) -> CoreResult<bool>;
}

/// In-memory interrupt collection
#[derive(Default)]
pub struct MemoryInterruptStore {
    interrupts: RwLock<BTreeMap<InterruptId, Interrupt>>,
}

impl MemoryInterruptStore {
    /// Create an empty collection
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InterruptStore for MemoryInterruptStore {
    async fn save(&self, interrupt: Interrupt) -> CoreResult<Interrupt> {
        let mut interrupts = self.interrupts.write().await;
        if interrupts.contains_key(&interrupt.id) {
            return Err(CoreError::AlreadyExists {
                kind: "Interrupt".to_string(),
                id: interrupt.id.to_string(),
            });
        }
        interrupts.insert(interrupt.id, interrupt.clone());
        Ok(interrupt)
    }

    async fn get(&self, id: InterruptId) -> CoreResult<Option<Interrupt>> {
        Ok(self.interrupts.read().await.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: InterruptId,
        from: &[InterruptState],
        to: InterruptState,
    ) -> CoreResult<Option<Interrupt>> {
        let mut interrupts = self.interrupts.write().await;
        let Some(interrupt) = interrupts.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&interrupt.state) {
            tracing::debug!(
                interrupt_id = %id,
                state = %interrupt.state,
                requested = %to,
                "Interrupt transition skipped"
            );
            return Ok(None);
        }
        if !interrupt.state.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                kind: "Interrupt".to_string(),
                id: id.to_string(),
                from: interrupt.state.to_string(),
                to: to.to_string(),
            });
        }
        interrupt.state = to;
        Ok(Some(interrupt.clone()))
    }

    async fn find_by_plan(
        &self,
        plan_execution_id: PlanExecutionId,
        states: &[InterruptState],
    ) -> CoreResult<Vec<Interrupt>> {
        let interrupts = self.interrupts.read().await;
        let mut found: Vec<Interrupt> = interrupts
            .values()
            .filter(|i| i.plan_execution_id == plan_execution_id)
            .filter(|i| states.is_empty() || states.contains(&i.state))
            .cloned()
            .collect();
        found.sort_by_key(|i| i.created_at);
        Ok(found)
    }

    async fn find_stuck(
        &self,
        query: &StuckInterruptQuery,
        page: PageRequest<InterruptId>,
    ) -> CoreResult<Vec<Interrupt>> {
        let interrupts = self.interrupts.read().await;
        let range = match page.after {
            Some(cursor) => interrupts.range((std::ops::Bound::Excluded(cursor), std::ops::Bound::Unbounded)),
            None => interrupts.range(..),
        };
        Ok(range
            .map(|(_, i)| i)
            .filter(|i| query.matches(i))
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn claim_iteration(
        &self,
        id: InterruptId,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let mut interrupts = self.interrupts.write().await;
        match interrupts.get_mut(&id) {
            Some(interrupt) if interrupt.next_iteration == expected => {
                interrupt.next_iteration = Some(next);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
