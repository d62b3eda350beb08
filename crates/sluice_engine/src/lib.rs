//! SLUICE Engine
//!
//! Assembles one replica of the pipeline control plane: the interrupt
//! registry, the resource restraint service, the end-of-execution observer
//! and the two background monitors, all over pluggable collaborators.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod observer;
pub mod plane;

pub use config::{ConfigError, ControlPlaneConfig};
pub use observer::{EndReport, ExecutionEndObserver};
pub use plane::{Collaborators, ControlPlane};
