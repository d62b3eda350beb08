//! Resource restraint documents: named semaphores and their holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::id::{PlanExecutionId, RestraintId, RestraintInstanceId};

/// Separator inside composite release entity ids
pub const RELEASE_ENTITY_SEPARATOR: char = '|';

/// Admission policy of a restraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    /// Admit anything that fits, regardless of who waited first
    Asap,
    /// Admit strictly in request order
    Fifo,
}

/// A named, capacity-bounded semaphore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRestraint {
    /// Restraint id
    pub id: RestraintId,
    /// Owning account
    pub account_id: String,
    /// Unique name within the account
    pub name: String,
    /// Permits available per resource unit
    pub capacity: u32,
    /// Admission policy
    pub strategy: Strategy,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Admission view of a restraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// Restraint id
    pub id: RestraintId,
    /// Permits available per resource unit
    pub capacity: u32,
    /// Admission policy
    pub strategy: Strategy,
}

impl From<&ResourceRestraint> for Constraint {
    fn from(restraint: &ResourceRestraint) -> Self {
        Self {
            id: restraint.id,
            capacity: restraint.capacity,
            strategy: restraint.strategy,
        }
    }
}

/// Scope a hold is released with (the `releaseEntityType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldingScope {
    /// Released when the plan execution ends
    Pipeline,
    /// Released when the stage node execution ends
    Stage,
}

impl std::fmt::Display for HoldingScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HoldingScope::Pipeline => f.write_str("PIPELINE"),
            HoldingScope::Stage => f.write_str("STAGE"),
        }
    }
}

/// Whether a repeated request from the same entity acquires again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquireMode {
    /// Every request creates a new hold
    #[default]
    Accumulate,
    /// Reuse the entity's existing hold on the same unit
    Ensure,
}

/// Parsed owner of a hold
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReleaseEntity {
    /// Whole plan execution
    Pipeline {
        /// Plan execution
        plan_execution_id: PlanExecutionId,
    },
    /// One stage of a plan execution
    Stage {
        /// Plan execution
        plan_execution_id: PlanExecutionId,
        /// Plan node id of the stage
        setup_node_id: String,
    },
}

impl ReleaseEntity {
    /// Pipeline-scoped owner
    #[must_use]
    pub fn pipeline(plan_execution_id: PlanExecutionId) -> Self {
        Self::Pipeline { plan_execution_id }
    }

    /// Stage-scoped owner
    #[must_use]
    pub fn stage(plan_execution_id: PlanExecutionId, setup_node_id: &str) -> Self {
        Self::Stage {
            plan_execution_id,
            setup_node_id: setup_node_id.to_string(),
        }
    }

    /// Scope of this owner
    #[must_use]
    pub fn scope(&self) -> HoldingScope {
        match self {
            Self::Pipeline { .. } => HoldingScope::Pipeline,
            Self::Stage { .. } => HoldingScope::Stage,
        }
    }

    /// Plan execution the owner belongs to
    #[must_use]
    pub fn plan_execution_id(&self) -> PlanExecutionId {
        match self {
            Self::Pipeline { plan_execution_id } | Self::Stage { plan_execution_id, .. } => {
                *plan_execution_id
            }
        }
    }

    /// Composite `releaseEntityId` string
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Pipeline { plan_execution_id } => plan_execution_id.to_string(),
            Self::Stage {
                plan_execution_id,
                setup_node_id,
            } => format!("{}{}{}", plan_execution_id, RELEASE_ENTITY_SEPARATOR, setup_node_id),
        }
    }

    /// Parse a `releaseEntityId` for the given scope
    ///
    /// # Errors
    ///
    /// Returns error if the key does not have the shape the scope requires
    pub fn parse(scope: HoldingScope, key: &str) -> CoreResult<Self> {
        match scope {
            HoldingScope::Pipeline => Ok(Self::Pipeline {
                plan_execution_id: key.parse()?,
            }),
            HoldingScope::Stage => {
                let (plan, setup) = key.split_once(RELEASE_ENTITY_SEPARATOR).ok_or_else(|| {
                    CoreError::validation(
                        "releaseEntityId",
                        format!("stage release entity {} lacks a setup node id", key),
                    )
                })?;
                if setup.is_empty() {
                    return Err(CoreError::validation(
                        "releaseEntityId",
                        format!("stage release entity {} has an empty setup node id", key),
                    ));
                }
                Ok(Self::Stage {
                    plan_execution_id: plan.parse()?,
                    setup_node_id: setup.to_string(),
                })
            }
        }
    }
}

/// State of a hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestraintState {
    /// Waiting for capacity
    Blocked,
    /// Holding permits
    Active,
    /// Released (terminal)
    Finished,
}

impl std::fmt::Display for RestraintState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestraintState::Blocked => f.write_str("BLOCKED"),
            RestraintState::Active => f.write_str("ACTIVE"),
            RestraintState::Finished => f.write_str("FINISHED"),
        }
    }
}

/// One consumer's hold (or pending request) against a restraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRestraintInstance {
    /// Instance id
    pub id: RestraintInstanceId,
    /// Restraint this instance draws from
    pub resource_restraint_id: RestraintId,
    /// Key partitioning capacity, e.g. an environment name
    pub resource_unit: String,
    /// Scope the hold is released with
    pub release_entity_type: HoldingScope,
    /// Composite owner key
    pub release_entity_id: String,
    /// Who asked for the hold
    pub claimant_id: Option<String>,
    /// Request order, strictly increasing per restraint
    pub order: u64,
    /// Requested permits
    pub permits: u32,
    /// Current state
    pub state: RestraintState,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time the hold became active
    pub acquired_at: Option<DateTime<Utc>>,
}

impl ResourceRestraintInstance {
    /// Parsed owner of this hold
    ///
    /// # Errors
    ///
    /// Returns error if the stored release entity id is malformed
    pub fn release_entity(&self) -> CoreResult<ReleaseEntity> {
        ReleaseEntity::parse(self.release_entity_type, &self.release_entity_id)
    }
}
