//! SLUICE Resource Restraint
//!
//! Distributed semaphores for pipeline steps. A restraint caps how many
//! permits may be held at once per resource unit; each request becomes an
//! instance in the ledger that is BLOCKED until it fits, ACTIVE while it
//! holds permits, and FINISHED once released. Permit accounting is always
//! derived from the ACTIVE instances in the ledger.
//!
//! The [`RestraintMonitor`] periodically re-processes every open instance so
//! that a lost release callback never strands capacity.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod monitor;
pub mod service;

pub use error::{RestraintError, RestraintResult};
pub use monitor::RestraintMonitor;
pub use service::{
    AdmissionOutcome, AdmissionRequest, ResourceRestraintService, RestraintServiceConfig, restraint_lock_name,
};
