//! SLUICE Interrupts
//!
//! Out-of-band control of running plans: abort, expire, pause, resume, retry
//! and status overrides. Registration is serialized per plan by a distributed
//! lock and dispatched through a [`HandlerFactory`] that is complete by
//! construction. Terminations are confirmed asynchronously through keyed
//! completions consumed by the [`TerminationCallback`]; the
//! [`InterruptMonitor`] forces stuck discontinuations to an end when those
//! completions are lost.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod callback;
pub mod error;
pub mod factory;
pub mod handlers;
pub mod manager;
pub mod monitor;
pub mod terminator;

pub use callback::TerminationCallback;
pub use error::{InterruptError, InterruptResult};
pub use factory::HandlerFactory;
pub use handlers::{HandlerContext, InterruptHandler};
pub use manager::{InterruptManager, plan_lock_name};
pub use monitor::{InterruptMonitor, InterruptMonitorConfig, Reconciliation};
pub use terminator::{LoopbackTerminator, RecordingTerminator, StepTerminator, parse_termination_key, termination_key};
