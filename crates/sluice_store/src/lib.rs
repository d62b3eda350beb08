//! SLUICE Store
//!
//! Capability traits for the collaborators the control plane relies on but
//! does not own: the execution store, the interrupt and restraint
//! collections, the distributed lock provider and the notification bus.
//! Every trait ships with an in-memory backend used by tests and by the
//! development replica.
//!
//! All mutations are conditional on the document's current state, so that
//! several replicas may race on the same records without corrupting them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod execution;
pub mod interrupt;
pub mod ledger;
pub mod lock;
pub mod notify;

pub use execution::{ExecutionStore, MemoryExecutionStore, StoreFault};
pub use interrupt::{InterruptStore, MemoryInterruptStore, StuckInterruptQuery};
pub use ledger::{InstanceFilter, MemoryRestraintLedger, RestraintLedger};
pub use lock::{AcquiredLock, InMemoryLockProvider, LockProvider, acquire_or_retry_later};
pub use notify::{InMemoryNotifyBus, NotifyBus, NotifyCallback};

/// A page request over a collection ordered by document id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest<C> {
    /// Return documents strictly after this cursor
    pub after: Option<C>,
    /// Maximum number of documents
    pub limit: usize,
}

impl<C> PageRequest<C> {
    /// First page
    #[must_use]
    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }

    /// Page following `cursor`
    #[must_use]
    pub fn after(cursor: C, limit: usize) -> Self {
        Self {
            after: Some(cursor),
            limit,
        }
    }
}
