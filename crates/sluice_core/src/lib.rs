//! SLUICE Core Types
//!
//! Pure types and logic with no I/O: identifiers, execution statuses, the
//! persisted document shapes of the control plane, and the in-memory
//! execution-tree arena used during reconciliation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod execution;
pub mod id;
pub mod interrupt;
pub mod restraint;
pub mod status;
pub mod time;
pub mod tree;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use execution::{Ambiance, Level, NodeExecution, PlanExecution};
pub use id::{InterruptId, NodeExecutionId, PlanExecutionId, RestraintId, RestraintInstanceId};
pub use interrupt::{Interrupt, InterruptConfig, InterruptPackage, InterruptState, InterruptType};
pub use restraint::{
    AcquireMode, Constraint, HoldingScope, ReleaseEntity, ResourceRestraint,
    ResourceRestraintInstance, RestraintState, Strategy,
};
pub use status::{ExecutionMode, Status};
pub use time::{Clock, ManualClock, SystemClock};
pub use tree::ExecutionTree;
