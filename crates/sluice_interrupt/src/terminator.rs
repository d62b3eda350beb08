//! Step termination capability.
//!
//! Stopping a running step is the step executor's business. The control
//! plane only asks for it and waits for the completion notification keyed by
//! [`termination_key`].

use async_trait::async_trait;
use serde_json::json;
use sluice_core::{CoreError, CoreResult, Interrupt, InterruptId, NodeExecution, NodeExecutionId};
use sluice_store::NotifyBus;
use std::sync::{Arc, Mutex};

/// Correlation key of a termination: `nodeExecutionId|interruptId`
#[must_use]
pub fn termination_key(node_execution_id: NodeExecutionId, interrupt_id: InterruptId) -> String {
    format!("{}|{}", node_execution_id, interrupt_id)
}

/// Split a termination key back into its ids
///
/// # Errors
///
/// Returns error if the key is not two ids joined by `|`
pub fn parse_termination_key(key: &str) -> CoreResult<(NodeExecutionId, InterruptId)> {
    let (node, interrupt) = key
        .split_once('|')
        .ok_or_else(|| CoreError::validation("key", format!("malformed termination key {}", key)))?;
    Ok((node.parse()?, interrupt.parse()?))
}

/// Asks the step executor to stop a node execution
#[async_trait]
pub trait StepTerminator: Send + Sync {
    /// Request termination of `node` on behalf of `interrupt`
    ///
    /// Completion must be published on the notification bus under `key`.
    /// Requests may be repeated and must be idempotent.
    async fn terminate(&self, node: &NodeExecution, interrupt: &Interrupt, key: &str) -> CoreResult<()>;
}

/// Terminator that acknowledges every request at once
///
/// Stands in for the step executor when the replica runs without one.
pub struct LoopbackTerminator {
    bus: Arc<dyn NotifyBus>,
}

impl LoopbackTerminator {
    /// Publish completions on `bus`
    #[must_use]
    pub fn new(bus: Arc<dyn NotifyBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl StepTerminator for LoopbackTerminator {
    async fn terminate(&self, node: &NodeExecution, interrupt: &Interrupt, key: &str) -> CoreResult<()> {
        tracing::debug!(node_execution_id = %node.id, interrupt_id = %interrupt.id, "Loopback termination");
        self.bus
            .done_with(key, json!({ "interruptType": interrupt.interrupt_type.as_str() }))
            .await;
        Ok(())
    }
}

/// Terminator that only records requests; completions never arrive
///
/// Models lost notifications.
#[derive(Default)]
pub struct RecordingTerminator {
    requests: Mutex<Vec<String>>,
}

impl RecordingTerminator {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys of every termination requested so far
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl StepTerminator for RecordingTerminator {
    async fn terminate(&self, _node: &NodeExecution, _interrupt: &Interrupt, key: &str) -> CoreResult<()> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.to_string());
        Ok(())
    }
}
