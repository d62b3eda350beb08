//! Paged iteration over a persisted collection.

use crate::config::IteratorConfig;
use async_trait::async_trait;
use futures::StreamExt;
use sluice_core::CoreResult;

/// A sweep over a collection, one page at a time
///
/// Pages are requested with the cursor of the last item of the previous
/// page, so documents created or modified during a pass are picked up either
/// in this pass or the next one.
#[async_trait]
pub trait PagedHandler: Send + Sync + 'static {
    /// Document type
    type Item: Send + 'static;
    /// Page cursor
    type Cursor: Clone + Send + Sync + 'static;

    /// Iterator name, used in logs
    fn name(&self) -> &str;

    /// Fetch up to `limit` documents after `after`
    async fn fetch_page(&self, after: Option<Self::Cursor>, limit: usize) -> CoreResult<Vec<Self::Item>>;

    /// Cursor of a document
    fn cursor(&self, item: &Self::Item) -> Self::Cursor;

    /// Process one document
    async fn handle(&self, item: Self::Item) -> CoreResult<()>;
}

/// Outcome counters of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Pages fetched
    pub pages: u64,
    /// Items handled without error
    pub processed: u64,
    /// Items whose handler returned an error
    pub failed: u64,
    /// Items abandoned after exceeding the budget
    pub timed_out: u64,
    /// Whether fetching a page failed and ended the pass early
    pub aborted: bool,
}

impl PassReport {
    /// Items looked at in this pass
    #[must_use]
    pub fn total(&self) -> u64 {
        self.processed + self.failed + self.timed_out
    }

    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Done => self.processed += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::TimedOut => self.timed_out += 1,
        }
    }
}

enum ItemOutcome {
    Done,
    Failed,
    TimedOut,
}

/// Run one full pass of `handler`
///
/// Never fails: page errors end the pass, item errors are counted and logged.
pub async fn run_pass<H: PagedHandler>(handler: &H, config: &IteratorConfig) -> PassReport {
    let mut report = PassReport::default();
    let mut cursor: Option<H::Cursor> = None;
    let budget = config.item_budget();
    let name = handler.name();

    loop {
        let page = match handler.fetch_page(cursor.clone(), config.page_size).await {
            Ok(page) => page,
            Err(e) => {
                tracing::error!(iterator = name, error = %e, "Failed to fetch page");
                report.aborted = true;
                break;
            }
        };
        report.pages += 1;
        let Some(last) = page.last() else {
            break;
        };
        let full_page = page.len() >= config.page_size;
        cursor = Some(handler.cursor(last));

        let outcomes: Vec<ItemOutcome> = futures::stream::iter(page)
            .map(|item| async move {
                match tokio::time::timeout(budget, handler.handle(item)).await {
                    Ok(Ok(())) => ItemOutcome::Done,
                    Ok(Err(e)) => {
                        tracing::warn!(iterator = name, error = %e, "Item failed, retrying next pass");
                        ItemOutcome::Failed
                    }
                    Err(_) => {
                        tracing::warn!(iterator = name, ?budget, "Item exceeded its budget");
                        ItemOutcome::TimedOut
                    }
                }
            })
            .buffer_unordered(config.pool_size.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }

        if !full_page {
            break;
        }
    }

    tracing::debug!(
        iterator = name,
        pages = report.pages,
        processed = report.processed,
        failed = report.failed,
        timed_out = report.timed_out,
        "Pass complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::CoreError;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Numbers {
        items: Vec<u32>,
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl PagedHandler for Numbers {
        type Item = u32;
        type Cursor = u32;

        fn name(&self) -> &str {
            "numbers"
        }

        async fn fetch_page(&self, after: Option<u32>, limit: usize) -> CoreResult<Vec<u32>> {
            Ok(self
                .items
                .iter()
                .copied()
                .filter(|n| after.is_none_or(|a| *n > a))
                .take(limit)
                .collect())
        }

        fn cursor(&self, item: &u32) -> u32 {
            *item
        }

        async fn handle(&self, item: u32) -> CoreResult<()> {
            if item == 3 {
                return Err(CoreError::Internal {
                    message: "bad record".to_string(),
                });
            }
            if item == 5 {
                tokio::time::sleep(Duration::from_secs(120)).await;
            }
            self.seen.lock().unwrap().push(item);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_visits_every_page_and_isolates_failures() {
        let handler = Numbers {
            items: (1..=7).collect(),
            seen: Mutex::new(Vec::new()),
        };
        let config = IteratorConfig::default().with_page_size(3).with_item_budget_secs(1);

        let report = run_pass(&handler, &config).await;

        assert_eq!(report.pages, 3);
        assert_eq!(report.processed, 5);
        assert_eq!(report.failed, 1);
        assert_eq!(report.timed_out, 1);
        assert!(!report.aborted);
        let mut seen = handler.seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 4, 6, 7]);
    }

    #[tokio::test]
    async fn test_empty_collection_single_page() {
        let handler = Numbers {
            items: Vec::new(),
            seen: Mutex::new(Vec::new()),
        };
        let report = run_pass(&handler, &IteratorConfig::default()).await;
        assert_eq!(report.pages, 1);
        assert_eq!(report.total(), 0);
    }
}
