//! Unique identifiers for SLUICE documents.
//!
//! All IDs are UUIDs. They display as the bare hyphenated UUID so they can be
//! composed into lock names and callback keys and parsed back out again.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! document_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random id
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from UUID bytes
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Get as UUID
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

document_id!(
    /// Plan execution identifier - one run of a pipeline
    PlanExecutionId
);

document_id!(
    /// Node execution identifier - one step instance within a plan execution
    NodeExecutionId
);

document_id!(
    /// Interrupt identifier
    InterruptId
);

document_id!(
    /// Resource restraint identifier - a named capacity-bounded semaphore
    RestraintId
);

document_id!(
    /// Resource restraint instance identifier - one consumer's hold or request
    RestraintInstanceId
);
