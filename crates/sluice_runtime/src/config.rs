//! Iterator configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Invalid iterator configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IteratorConfigError {
    /// Pool must have at least one worker
    #[error("{iterator}: pool_size must be at least 1")]
    EmptyPool {
        /// Iterator name
        iterator: String,
    },
    /// Interval must be at least one second
    #[error("{iterator}: interval_secs must be at least 1")]
    ZeroInterval {
        /// Iterator name
        iterator: String,
    },
    /// Pages must hold at least one document
    #[error("{iterator}: page_size must be at least 1")]
    EmptyPage {
        /// Iterator name
        iterator: String,
    },
}

/// Scheduling parameters of one periodic iterator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IteratorConfig {
    /// Whether the iterator runs at all
    pub enabled: bool,
    /// Items processed concurrently
    pub pool_size: usize,
    /// Seconds between passes
    pub interval_secs: u64,
    /// Documents fetched per page
    pub page_size: usize,
    /// Seconds one item may take before it is abandoned for this pass
    pub item_budget_secs: u64,
}

impl Default for IteratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool_size: 2,
            interval_secs: 60,
            page_size: 100,
            item_budget_secs: 30,
        }
    }
}

impl IteratorConfig {
    /// Set the worker pool size
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the pass interval
    #[must_use]
    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    /// Set the page size
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the per-item budget
    #[must_use]
    pub fn with_item_budget_secs(mut self, secs: u64) -> Self {
        self.item_budget_secs = secs;
        self
    }

    /// Enable or disable the iterator
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Pass interval as a duration
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Per-item budget as a duration
    #[must_use]
    pub fn item_budget(&self) -> Duration {
        Duration::from_secs(self.item_budget_secs)
    }

    /// Check the configuration of the iterator called `name`
    ///
    /// # Errors
    ///
    /// Returns error if pool size, interval or page size is zero
    pub fn validate(&self, name: &str) -> Result<(), IteratorConfigError> {
        let iterator = name.to_string();
        if self.pool_size == 0 {
            return Err(IteratorConfigError::EmptyPool { iterator });
        }
        if self.interval_secs == 0 {
            return Err(IteratorConfigError::ZeroInterval { iterator });
        }
        if self.page_size == 0 {
            return Err(IteratorConfigError::EmptyPage { iterator });
        }
        Ok(())
    }
}
