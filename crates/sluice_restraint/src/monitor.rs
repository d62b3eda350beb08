//! Resource restraint monitor.

use async_trait::async_trait;
use sluice_core::{CoreResult, ResourceRestraintInstance, RestraintInstanceId, RestraintState};
use sluice_runtime::{IteratorConfig, PagedHandler};
use sluice_store::PageRequest;
use std::sync::Arc;

use crate::service::ResourceRestraintService;

/// Periodic sweep over open restraint instances
///
/// Each BLOCKED or ACTIVE instance is handed to
/// [`ResourceRestraintService::process_restraint`], which releases holds of
/// owners that already ended and promotes waiters into the freed capacity.
pub struct RestraintMonitor {
    service: Arc<ResourceRestraintService>,
}

impl RestraintMonitor {
    /// Iterator name
    pub const NAME: &'static str = "resource-restraint-monitor";

    /// Create a monitor over `service`
    #[must_use]
    pub fn new(service: Arc<ResourceRestraintService>) -> Self {
        Self { service }
    }

    /// Default schedule: every minute, two workers, 30s per instance
    #[must_use]
    pub fn default_config() -> IteratorConfig {
        IteratorConfig::default()
            .with_interval_secs(60)
            .with_pool_size(2)
            .with_item_budget_secs(30)
    }
}

#[async_trait]
impl PagedHandler for RestraintMonitor {
    type Item = ResourceRestraintInstance;
    type Cursor = RestraintInstanceId;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn fetch_page(
        &self,
        after: Option<RestraintInstanceId>,
        limit: usize,
    ) -> CoreResult<Vec<ResourceRestraintInstance>> {
        self.service
            .ledger()
            .instances_page(
                &[RestraintState::Blocked, RestraintState::Active],
                PageRequest { after, limit },
            )
            .await
    }

    fn cursor(&self, item: &ResourceRestraintInstance) -> RestraintInstanceId {
        item.id
    }

    async fn handle(&self, item: ResourceRestraintInstance) -> CoreResult<()> {
        self.service.process_restraint(&item).await.map_err(Into::into)
    }
}
