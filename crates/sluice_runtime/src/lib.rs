//! SLUICE Runtime
//!
//! The periodic iteration facility behind the background sweeps: a handler
//! pages through a persisted collection on a fixed interval and processes
//! each page with bounded concurrency and a per-item time budget. Failures of
//! individual items are logged and left for the next pass.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod iterator;
pub mod scheduler;

pub use config::{IteratorConfig, IteratorConfigError};
pub use iterator::{PagedHandler, PassReport, run_pass};
pub use scheduler::{IteratorHandle, IteratorScheduler};
