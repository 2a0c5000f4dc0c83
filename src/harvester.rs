//! Crawls one storefront's candidate pages and collects email addresses.

use crate::config::{Config, EmailDenylist};
use crate::domain::{normalize_url, page_key};
use crate::emails::{EmailSet, filter_emails};
use crate::error::Result;
use crate::events::JobProgress;
use crate::extractor::extract_emails;
use crate::fetcher::{PageFetcher, fetch_with_retries};
use crate::models::{HarvestReport, HarvestStats};
use crate::planner::PagePlanner;
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pulls addresses out of a page body; `base_url` decides HTML or XML handling.
pub(crate) type ExtractFn = fn(&str, &str) -> EmailSet;

/// Orchestrates planner, fetcher and extractor for one storefront at a time.
///
/// Pages of a storefront are fetched sequentially with a fixed delay between
/// requests; concurrency happens across storefronts, one level up.
#[derive(Clone)]
pub(crate) struct Harvester {
    fetcher: Arc<dyn PageFetcher>,
    planner: PagePlanner,
    request_delay: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    denylist: EmailDenylist,
    extract: ExtractFn,
}

impl Harvester {
    pub(crate) fn new(fetcher: Arc<dyn PageFetcher>, config: &Config) -> Self {
        Self {
            fetcher,
            planner: PagePlanner::new(config.max_pages, config.sitemap_limit),
            request_delay: config.request_delay,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            denylist: config.denylist.clone(),
            extract: extract_emails,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_extractor(mut self, extract: ExtractFn) -> Self {
        self.extract = extract;
        self
    }

    /// Harvests email addresses from a storefront.
    ///
    /// # Arguments
    /// * `base_url` - Storefront URL; `https://` is assumed when the scheme is missing.
    /// * `store_name` - Used for logging only.
    /// * `progress` - Optional observer receiving page-level events.
    ///
    /// # Returns
    /// * `Ok(HarvestReport)` with filtered, sorted addresses and page counters. Page
    ///   failures are counted, never returned.
    /// * `Err(AppError)` only when `base_url` is unusable.
    pub(crate) async fn harvest(
        &self,
        base_url: &str,
        store_name: &str,
        progress: Option<JobProgress<'_>>,
    ) -> Result<HarvestReport> {
        let start_time = Instant::now();
        let base = normalize_url(base_url)?;
        tracing::info!(target: "harvest_task", "Starting email extraction for '{}': {}", store_name, base);

        let candidates = self.planner.plan(self.fetcher.as_ref(), &base).await;
        if let Some(p) = progress {
            p.pages_planned(candidates.len());
        }

        let mut stats = HarvestStats {
            discovered: candidates.len(),
            ..HarvestStats::default()
        };
        let mut found = EmailSet::new();
        let mut visited: HashSet<String> = HashSet::new();

        for (i, candidate) in candidates.iter().enumerate() {
            if !visited.insert(page_key(&candidate.url)) {
                continue;
            }
            if i > 0 && !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }

            tracing::debug!(
                target: "harvest_task",
                "Checking page {}/{}: {}",
                i + 1,
                candidates.len(),
                candidate.url
            );

            let page = fetch_with_retries(
                self.fetcher.as_ref(),
                &candidate.url,
                self.max_retries,
                self.retry_backoff,
            )
            .await;

            let Some(body) = page.body else {
                stats.failed += 1;
                if let Some(p) = progress {
                    p.page_visited(candidate.url.as_str(), false, 0);
                }
                continue;
            };

            let final_url = page.final_url.as_str();
            let page_emails = match catch_unwind(AssertUnwindSafe(|| (self.extract)(&body, final_url))) {
                Ok(emails) => emails,
                Err(_) => {
                    tracing::error!(target: "harvest_task", "Extraction panicked on {}; skipping page", final_url);
                    stats.failed += 1;
                    if let Some(p) = progress {
                        p.page_visited(candidate.url.as_str(), false, 0);
                    }
                    continue;
                }
            };

            stats.scraped += 1;
            if !page_emails.is_empty() {
                stats.with_emails += 1;
                tracing::info!(
                    target: "harvest_task",
                    "Found {} emails on {}: {}",
                    page_emails.len(),
                    candidate.url,
                    page_emails.iter().cloned().collect::<Vec<_>>().join(", ")
                );
            }
            if let Some(p) = progress {
                p.page_visited(candidate.url.as_str(), true, page_emails.len());
            }
            found.extend(page_emails.into_vec());
        }

        let raw_emails = filter_emails(found.into_vec(), &self.denylist);

        tracing::info!(
            target: "harvest_task",
            "Harvest for {} finished in {:.2?}. {} pages planned ({} scraped, {} failed, {} with emails). Kept {} emails.",
            base,
            start_time.elapsed(),
            stats.discovered,
            stats.scraped,
            stats.failed,
            stats.with_emails,
            raw_emails.len()
        );

        Ok(HarvestReport { raw_emails, stats })
    }
}
