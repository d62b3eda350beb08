//! Named distributed locks.
//!
//! A lock is held for as long as its [`AcquiredLock`] guard lives. Every
//! successful acquisition carries a fencing token that strictly increases
//! per provider.

use async_trait::async_trait;
use sluice_core::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Guard for a held lock; the lock is released when it is dropped
pub struct AcquiredLock {
    name: String,
    fencing_token: u64,
    _guard: Box<dyn Send + Sync>,
}

impl AcquiredLock {
    /// Wrap a backend-specific guard
    #[must_use]
    pub fn new(name: impl Into<String>, fencing_token: u64, guard: Box<dyn Send + Sync>) -> Self {
        Self {
            name: name.into(),
            fencing_token,
            _guard: guard,
        }
    }

    /// Lock name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fencing token of this acquisition
    #[must_use]
    pub fn fencing_token(&self) -> u64 {
        self.fencing_token
    }

    /// Release the lock now
    pub fn release(self) {
        tracing::trace!(lock = %self.name, token = self.fencing_token, "Lock released");
    }
}

impl std::fmt::Debug for AcquiredLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredLock")
            .field("name", &self.name)
            .field("fencing_token", &self.fencing_token)
            .finish()
    }
}

/// Provider of named mutual-exclusion locks
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Try to acquire `name`, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` when the lock is still held elsewhere after the wait.
    async fn try_acquire(&self, name: &str, timeout: Duration) -> CoreResult<Option<AcquiredLock>>;
}

/// Acquire a lock or fail with a retryable [`CoreError::LockUnavailable`]
pub async fn acquire_or_retry_later(
    provider: &dyn LockProvider,
    name: &str,
    timeout: Duration,
) -> CoreResult<AcquiredLock> {
    match provider.try_acquire(name, timeout).await? {
        Some(lock) => Ok(lock),
        None => {
            tracing::warn!(lock = %name, ?timeout, "Lock acquisition timed out");
            Err(CoreError::LockUnavailable {
                name: name.to_string(),
            })
        }
    }
}

type Slots = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Process-local lock provider
///
/// Only serializes callers sharing the same provider instance; a
/// multi-replica deployment needs a provider backed by shared storage.
/// A name's slot lives only while someone holds or waits for it.
#[derive(Default)]
pub struct InMemoryLockProvider {
    slots: Slots,
    next_token: AtomicU64,
}

impl InMemoryLockProvider {
    /// Create a provider with no locks held
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of names currently held or waited on
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn slot(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(name.to_string()).or_default().clone()
    }
}

// caller must have dropped its own handle on the slot
fn prune(slots: &Slots, name: &str) {
    let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());
    if slots.get(name).is_some_and(|slot| Arc::strong_count(slot) == 1) {
        slots.remove(name);
    }
}

struct SlotGuard {
    name: String,
    slots: Slots,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune(&self.slots, &self.name);
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn try_acquire(&self, name: &str, timeout: Duration) -> CoreResult<Option<AcquiredLock>> {
        let slot = self.slot(name);
        let acquired = tokio::time::timeout(timeout, slot.lock_owned()).await;
        match acquired {
            Ok(guard) => {
                let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::trace!(lock = %name, token, "Lock acquired");
                let guard = SlotGuard {
                    name: name.to_string(),
                    slots: self.slots.clone(),
                    guard: Some(guard),
                };
                Ok(Some(AcquiredLock::new(name, token, Box::new(guard))))
            }
            Err(_) => {
                prune(&self.slots, name);
                Ok(None)
            }
        }
    }
}
