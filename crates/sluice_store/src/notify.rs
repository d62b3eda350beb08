//! Notification bus.
//!
//! Subscribers register a callback under a correlation key; whoever finishes
//! the awaited work calls [`NotifyBus::done_with`] with the same key. A
//! completion that arrives before anyone subscribed is kept and delivered on
//! subscription.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Receiver of a completion notification
#[async_trait]
pub trait NotifyCallback: Send + Sync {
    /// Called once with the completion payload
    async fn notify(&self, key: &str, payload: Value);
}

/// Keyed, one-shot completion notifications
#[async_trait]
pub trait NotifyBus: Send + Sync {
    /// Register interest in the completion identified by `key`
    async fn subscribe(&self, key: &str, callback: Arc<dyn NotifyCallback>);

    /// Publish the completion identified by `key`
    async fn done_with(&self, key: &str, payload: Value);
}

#[derive(Default)]
struct BusState {
    waiting: HashMap<String, Vec<Arc<dyn NotifyCallback>>>,
    pending: HashMap<String, Vec<Value>>,
}

fn same_callback(a: &Arc<dyn NotifyCallback>, b: &Arc<dyn NotifyCallback>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Process-local notification bus
///
/// Subscribing the same callback twice under one key registers it once.
#[derive(Default)]
pub struct InMemoryNotifyBus {
    state: Mutex<BusState>,
}

impl InMemoryNotifyBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with registered subscribers
    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.waiting.len()
    }

    /// Number of subscribers registered under `key`
    pub async fn subscribers_of(&self, key: &str) -> usize {
        self.state.lock().await.waiting.get(key).map_or(0, Vec::len)
    }
}

#[async_trait]
impl NotifyBus for InMemoryNotifyBus {
    async fn subscribe(&self, key: &str, callback: Arc<dyn NotifyCallback>) {
        let pending = {
            let mut state = self.state.lock().await;
            match state.pending.remove(key) {
                Some(payloads) => payloads,
                None => {
                    let subscribers = state.waiting.entry(key.to_string()).or_default();
                    if !subscribers.iter().any(|s| same_callback(s, &callback)) {
                        subscribers.push(callback);
                    }
                    return;
                }
            }
        };
        for payload in pending {
            callback.notify(key, payload).await;
        }
    }

    async fn done_with(&self, key: &str, payload: Value) {
        let callbacks = {
            let mut state = self.state.lock().await;
            match state.waiting.remove(key) {
                Some(callbacks) => callbacks,
                None => {
                    tracing::debug!(key, "No subscriber yet, keeping completion");
                    state.pending.entry(key.to_string()).or_default().push(payload);
                    return;
                }
            }
        };
        for callback in callbacks {
            callback.notify(key, payload.clone()).await;
        }
    }
}
