//! Execution store capability.

use async_trait::async_trait;
use chrono::Utc;
use sluice_core::{
    CoreError, CoreResult, NodeExecution, NodeExecutionId, PlanExecution, PlanExecutionId, Status,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Failures the in-memory backends can be told to simulate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreFault {
    /// Backend temporarily unreachable
    #[error("execution store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreFault> for CoreError {
    fn from(err: StoreFault) -> Self {
        CoreError::Store {
            message: err.to_string(),
        }
    }
}

/// Persisted plan and node executions
///
/// Status updates are conditional: `allowed_from` lists the statuses the
/// document must currently have for the update to apply (empty means any).
/// A refused update returns `Ok(None)`, never an error.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Fetch a plan execution
    async fn get_plan_execution(&self, id: PlanExecutionId) -> CoreResult<Option<PlanExecution>>;

    /// Fetch only the status of a plan execution
    async fn get_plan_execution_status(&self, id: PlanExecutionId) -> CoreResult<Option<Status>> {
        Ok(self.get_plan_execution(id).await?.map(|p| p.status))
    }

    /// Conditionally update a plan execution status
    async fn update_plan_status(
        &self,
        id: PlanExecutionId,
        status: Status,
        allowed_from: &[Status],
    ) -> CoreResult<Option<PlanExecution>>;

    /// All node executions of a plan, including superseded retries
    async fn find_node_executions(&self, plan_execution_id: PlanExecutionId) -> CoreResult<Vec<NodeExecution>>;

    /// Fetch a node execution
    async fn get_node_execution(&self, id: NodeExecutionId) -> CoreResult<Option<NodeExecution>>;

    /// Current (non-superseded) execution of a plan node
    async fn find_by_setup_node(
        &self,
        plan_execution_id: PlanExecutionId,
        setup_node_id: &str,
    ) -> CoreResult<Option<NodeExecution>>;

    /// Conditionally update a node execution status
    async fn update_node_status(
        &self,
        id: NodeExecutionId,
        status: Status,
        allowed_from: &[Status],
    ) -> CoreResult<Option<NodeExecution>>;

    /// Flag a node execution as superseded by a retry
    async fn mark_old_retry(&self, id: NodeExecutionId) -> CoreResult<Option<NodeExecution>>;

    /// Insert or replace a plan execution
    async fn save_plan_execution(&self, plan: PlanExecution) -> CoreResult<()>;

    /// Insert or replace a node execution
    async fn save_node_execution(&self, node: NodeExecution) -> CoreResult<()>;
}

#[derive(Default)]
struct ExecutionState {
    plans: HashMap<PlanExecutionId, PlanExecution>,
    nodes: HashMap<NodeExecutionId, NodeExecution>,
    // insertion order per plan, so tree loads are stable
    plan_nodes: HashMap<PlanExecutionId, Vec<NodeExecutionId>>,
}

/// In-memory execution store
#[derive(Default)]
pub struct MemoryExecutionStore {
    state: RwLock<ExecutionState>,
    unavailable: AtomicBool,
}

impl MemoryExecutionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> CoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreFault::Unavailable("simulated outage".to_string()).into());
        }
        Ok(())
    }
}

fn transition_allowed(current: Status, allowed_from: &[Status]) -> bool {
    allowed_from.is_empty() || allowed_from.contains(&current)
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn get_plan_execution(&self, id: PlanExecutionId) -> CoreResult<Option<PlanExecution>> {
        self.check_available()?;
        Ok(self.state.read().await.plans.get(&id).cloned())
    }

    async fn update_plan_status(
        &self,
        id: PlanExecutionId,
        status: Status,
        allowed_from: &[Status],
    ) -> CoreResult<Option<PlanExecution>> {
        let mut state = self.state.write().await;
        let Some(plan) = state.plans.get_mut(&id) else {
            return Ok(None);
        };
        if !transition_allowed(plan.status, allowed_from) {
            return Ok(None);
        }
        plan.status = status;
        if status.is_final() && plan.end_ts.is_none() {
            plan.end_ts = Some(Utc::now());
        }
        Ok(Some(plan.clone()))
    }

    async fn find_node_executions(&self, plan_execution_id: PlanExecutionId) -> CoreResult<Vec<NodeExecution>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .plan_nodes
            .get(&plan_execution_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect())
    }

    async fn get_node_execution(&self, id: NodeExecutionId) -> CoreResult<Option<NodeExecution>> {
        self.check_available()?;
        Ok(self.state.read().await.nodes.get(&id).cloned())
    }

    async fn find_by_setup_node(
        &self,
        plan_execution_id: PlanExecutionId,
        setup_node_id: &str,
    ) -> CoreResult<Option<NodeExecution>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .plan_nodes
            .get(&plan_execution_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| n.setup_node_id == setup_node_id && !n.old_retry)
            .last()
            .cloned())
    }

    async fn update_node_status(
        &self,
        id: NodeExecutionId,
        status: Status,
        allowed_from: &[Status],
    ) -> CoreResult<Option<NodeExecution>> {
        let mut state = self.state.write().await;
        let Some(node) = state.nodes.get_mut(&id) else {
            return Ok(None);
        };
        if !transition_allowed(node.status, allowed_from) {
            return Ok(None);
        }
        node.status = status;
        if status.is_final() && node.end_ts.is_none() {
            node.end_ts = Some(Utc::now());
        }
        Ok(Some(node.clone()))
    }

    async fn mark_old_retry(&self, id: NodeExecutionId) -> CoreResult<Option<NodeExecution>> {
        let mut state = self.state.write().await;
        Ok(state.nodes.get_mut(&id).map(|node| {
            node.old_retry = true;
            node.clone()
        }))
    }

    async fn save_plan_execution(&self, plan: PlanExecution) -> CoreResult<()> {
        self.state.write().await.plans.insert(plan.id, plan);
        Ok(())
    }

    async fn save_node_execution(&self, node: NodeExecution) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let order = state.plan_nodes.entry(node.plan_execution_id()).or_default();
        if !order.contains(&node.id) {
            order.push(node.id);
        }
        state.nodes.insert(node.id, node);
        Ok(())
    }
}
