//! Execution statuses and execution modes.

use serde::{Deserialize, Serialize};

/// Status of a plan or node execution
///
/// Statuses only move toward the final set. The control plane never invents
/// statuses of its own; it requests transitions through the execution store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Waiting to start
    Queued,
    /// Doing work
    Running,
    /// Pause requested, not yet quiesced
    Pausing,
    /// Paused by an interrupt
    Paused,
    /// Abort or expiry in flight
    Discontinuing,
    /// Aborted (final)
    Aborted,
    /// Expired (final)
    Expired,
    /// Succeeded (final)
    Succeeded,
    /// Failed (final)
    Failed,
    /// Skipped (final)
    Skipped,
}

impl Status {
    /// Statuses from which an execution never moves on its own
    pub const FINAL: [Status; 5] = [
        Status::Aborted,
        Status::Expired,
        Status::Succeeded,
        Status::Failed,
        Status::Skipped,
    ];

    /// Statuses that are not final
    pub const ACTIVE: [Status; 5] = [
        Status::Queued,
        Status::Running,
        Status::Pausing,
        Status::Paused,
        Status::Discontinuing,
    ];

    /// Whether this status is final
    #[must_use]
    pub fn is_final(self) -> bool {
        Self::FINAL.contains(&self)
    }

    /// Whether an abort/expiry for this execution is in flight or about to be issued
    #[must_use]
    pub fn is_discontinuable_leaf(self) -> bool {
        matches!(self, Status::Discontinuing | Status::Queued)
    }

    /// Whether this is a failure-family final status
    #[must_use]
    pub fn is_broken(self) -> bool {
        matches!(self, Status::Aborted | Status::Expired | Status::Failed)
    }

    /// Derive a parent or plan status from its children
    ///
    /// Any non-final child keeps the parent running. Otherwise the most severe
    /// child outcome wins: aborted, then expired, then failed, then succeeded.
    #[must_use]
    pub fn aggregate<I>(children: I) -> Status
    where
        I: IntoIterator<Item = Status>,
    {
        let mut result = Status::Succeeded;
        let mut any = false;
        for status in children {
            any = true;
            if !status.is_final() {
                return Status::Running;
            }
            if status.severity() > result.severity() {
                result = status;
            }
        }
        if any { result } else { Status::Succeeded }
    }

    fn severity(self) -> u8 {
        match self {
            Status::Aborted => 4,
            Status::Expired => 3,
            Status::Failed => 2,
            Status::Succeeded => 1,
            _ => 0,
        }
    }

    /// Upper-case wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::Pausing => "PAUSING",
            Status::Paused => "PAUSED",
            Status::Discontinuing => "DISCONTINUING",
            Status::Aborted => "ABORTED",
            Status::Expired => "EXPIRED",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a node execution is driven by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Runs inline
    Sync,
    /// Waits on an external callback
    Async,
    /// Delegated task
    Task,
    /// Chain of delegated tasks
    TaskChain,
    /// Spawns a single child
    Child,
    /// Spawns children one after another
    ChildChain,
    /// Spawns children in parallel
    Children,
}

impl ExecutionMode {
    /// Whether a node in this mode does actual work instead of orchestrating children
    #[must_use]
    pub fn is_leaf_mode(self) -> bool {
        !matches!(
            self,
            ExecutionMode::Child | ExecutionMode::ChildChain | ExecutionMode::Children
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_statuses() {
        assert!(Status::Succeeded.is_final());
        assert!(Status::Aborted.is_final());
        assert!(!Status::Discontinuing.is_final());
        assert!(!Status::Paused.is_final());
    }

    #[test]
    fn test_active_and_final_partition() {
        for s in Status::ACTIVE {
            assert!(!s.is_final());
        }
        for s in Status::FINAL {
            assert!(s.is_final());
        }
    }

    #[test]
    fn test_aggregate_running_child_keeps_parent_running() {
        let status = Status::aggregate([Status::Succeeded, Status::Running]);
        assert_eq!(status, Status::Running);
    }

    #[test]
    fn test_aggregate_severity() {
        assert_eq!(
            Status::aggregate([Status::Succeeded, Status::Failed, Status::Aborted]),
            Status::Aborted
        );
        assert_eq!(
            Status::aggregate([Status::Expired, Status::Failed]),
            Status::Expired
        );
        assert_eq!(
            Status::aggregate([Status::Succeeded, Status::Skipped]),
            Status::Succeeded
        );
        assert_eq!(Status::aggregate([]), Status::Succeeded);
    }

    #[test]
    fn test_leaf_modes() {
        assert!(ExecutionMode::Task.is_leaf_mode());
        assert!(ExecutionMode::Async.is_leaf_mode());
        assert!(!ExecutionMode::Children.is_leaf_mode());
    }

    #[test]
    fn test_status_serde_name() {
        let json = serde_json::to_string(&Status::Discontinuing).unwrap();
        assert_eq!(json, "\"DISCONTINUING\"");
    }

    fn any_status() -> impl proptest::strategy::Strategy<Value = Status> {
        proptest::sample::select(vec![
            Status::Queued,
            Status::Running,
            Status::Pausing,
            Status::Paused,
            Status::Discontinuing,
            Status::Aborted,
            Status::Expired,
            Status::Succeeded,
            Status::Failed,
            Status::Skipped,
        ])
    }

    proptest::proptest! {
        #[test]
        fn prop_aggregate_final_iff_children_final(children in proptest::collection::vec(any_status(), 1..8)) {
            let aggregate = Status::aggregate(children.iter().copied());
            proptest::prop_assert_eq!(aggregate.is_final(), children.iter().all(|s| s.is_final()));
            if children.contains(&Status::Aborted) && aggregate.is_final() {
                proptest::prop_assert_eq!(aggregate, Status::Aborted);
            }
        }
    }
}
