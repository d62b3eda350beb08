//! Background scheduling of periodic iterators.

use crate::config::{IteratorConfig, IteratorConfigError};
use crate::iterator::{PagedHandler, run_pass};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Handle to one running iterator
pub struct IteratorHandle {
    name: String,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl IteratorHandle {
    /// Iterator name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal shutdown and wait for the current pass to finish
    pub async fn stop(self) {
        // notify_one stores a permit if the loop is mid-pass
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            tracing::error!(iterator = %self.name, error = %e, "Iterator task panicked");
        }
    }

    /// Spawn `handler` on its own task, one pass per interval tick
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn spawn<H: PagedHandler>(handler: Arc<H>, config: IteratorConfig) -> Result<Self, IteratorConfigError> {
        let name = handler.name().to_string();
        config.validate(&name)?;
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        run_pass(handler.as_ref(), &config).await;
                    }
                    _ = signal.notified() => {
                        debug!(iterator = handler.name(), "Iterator shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self { name, shutdown, task })
    }
}

/// Registry of the periodic iterators of one replica
#[derive(Default)]
pub struct IteratorScheduler {
    handles: Mutex<Vec<IteratorHandle>>,
}

impl IteratorScheduler {
    /// Create an empty scheduler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and start a periodic iterator
    ///
    /// Disabled iterators are accepted and never started.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub async fn register<H: PagedHandler>(
        &self,
        handler: Arc<H>,
        config: IteratorConfig,
    ) -> Result<bool, IteratorConfigError> {
        if !config.enabled {
            info!(iterator = handler.name(), "Iterator disabled");
            return Ok(false);
        }
        info!(
            iterator = handler.name(),
            pool_size = config.pool_size,
            interval_secs = config.interval_secs,
            "Iterator registered"
        );
        let handle = IteratorHandle::spawn(handler, config)?;
        self.handles.lock().await.push(handle);
        Ok(true)
    }

    /// Number of running iterators
    pub async fn running(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Stop every iterator and wait for them
    pub async fn stop_all(&self) {
        let handles: Vec<IteratorHandle> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            handle.stop().await;
        }
    }
}
