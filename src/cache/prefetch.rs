// Bounded-concurrency media prefetch

use futures::stream::{self, StreamExt};
use log::debug;
use std::collections::HashSet;

use super::CacheManager;

/// Result of trying to cache one media URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchOutcome {
    /// Fetched and stored
    Cached,
    /// Already present, no fetch issued
    AlreadyCached,
    /// Rejected before any fetch (malformed URL)
    Skipped,
    /// Fetch or store failed; logged and ignored
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub fetched: usize,
    pub hits: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PrefetchReport {
    pub fn record(&mut self, outcome: PrefetchOutcome) {
        match outcome {
            PrefetchOutcome::Cached => self.fetched += 1,
            PrefetchOutcome::AlreadyCached => self.hits += 1,
            PrefetchOutcome::Skipped => self.skipped += 1,
            PrefetchOutcome::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.fetched + self.hits + self.skipped + self.failed
    }
}

/// Cache every distinct URL, running at most `concurrency` fetches at once
pub async fn prefetch_images<I>(cache: &CacheManager, urls: I, concurrency: usize) -> PrefetchReport
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    let urls: Vec<String> = urls.into_iter().filter(|url| seen.insert(url.clone())).collect();
    if urls.is_empty() {
        return PrefetchReport::default();
    }

    let report = stream::iter(urls)
        .map(move |url| async move { cache.cache_image(&url).await })
        .buffer_unordered(concurrency.max(1))
        .fold(PrefetchReport::default(), |mut report, outcome| async move {
            report.record(outcome);
            report
        })
        .await;

    debug!(
        "Prefetch for {}: {} fetched, {} cached, {} skipped, {} failed",
        cache.identity(),
        report.fetched,
        report.hits,
        report.skipped,
        report.failed
    );
    report
}
