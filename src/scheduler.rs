//! Admission control for storefront harvests.
//!
//! At most `max_concurrency` storefronts are harvested at once. Every finished
//! job persists its outcome, leaves the active set and admits the next eligible
//! storefront, so the pool keeps itself full until the store runs dry.
//!
//! The active set is the only shared scheduling state. It sits behind one async
//! mutex that is held across the eligibility query, which makes
//! check-then-insert atomic with respect to every other admission and release.

use crate::classifier::RelevanceClassifier;
use crate::config::Config;
use crate::error::Result;
use crate::events::{EventBus, HarvestEvent, JobProgress};
use crate::harvester::Harvester;
use crate::models::{HarvestJob, JobOutcome, Storefront, StorefrontId};
use crate::processor::process_storefront;
use crate::store::StorefrontStore;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Default)]
struct ActiveSet {
    jobs: HashMap<StorefrontId, HarvestJob>,
    /// Storefronts whose outcome could not be persisted; never admitted again.
    quarantined: HashSet<StorefrontId>,
}

pub(crate) struct Scheduler {
    store: Arc<dyn StorefrontStore>,
    harvester: Harvester,
    classifier: Option<Arc<dyn RelevanceClassifier>>,
    classifier_timeout: Option<Duration>,
    max_concurrency: usize,
    active: Mutex<ActiveSet>,
    idle: Notify,
    events: EventBus,
}

impl Scheduler {
    pub(crate) fn new(
        store: Arc<dyn StorefrontStore>,
        harvester: Harvester,
        classifier: Option<Arc<dyn RelevanceClassifier>>,
        config: &Config,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            harvester,
            classifier,
            classifier_timeout: config.classifier.timeout,
            max_concurrency: config.max_concurrency.max(1),
            active: Mutex::new(ActiveSet::default()),
            idle: Notify::new(),
            events,
        })
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Starts one more harvest if there is capacity and an eligible storefront.
    ///
    /// # Returns
    /// * `Ok(Some(id))` for the storefront that was dispatched.
    /// * `Ok(None)` when at capacity or nothing is eligible.
    /// * `Err(AppError)` when the store could not be queried.
    pub(crate) async fn admit(self: &Arc<Self>) -> Result<Option<StorefrontId>> {
        let mut active = self.active.lock().await;
        self.admit_locked(&mut active).await
    }

    /// Admits until capacity is reached or no eligible storefront is left.
    pub(crate) async fn top_off(self: &Arc<Self>) -> Result<usize> {
        let mut admitted = 0;
        while self.admit().await?.is_some() {
            admitted += 1;
        }
        tracing::info!(
            target: "scheduler",
            "Top-off admitted {} storefronts (capacity {})",
            admitted,
            self.max_concurrency
        );
        Ok(admitted)
    }

    /// Snapshot of the running harvests, oldest first.
    pub(crate) async fn active_jobs(&self) -> Vec<HarvestJob> {
        let active = self.active.lock().await;
        let mut jobs: Vec<HarvestJob> = active.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.started_at, j.storefront_id));
        jobs
    }

    /// Resolves once no harvest is running.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.lock().await.jobs.is_empty() {
                return;
            }
            notified.await;
        }
    }

    async fn admit_locked(self: &Arc<Self>, active: &mut ActiveSet) -> Result<Option<StorefrontId>> {
        if active.jobs.len() >= self.max_concurrency {
            tracing::debug!(target: "scheduler", "At capacity ({}), not admitting", self.max_concurrency);
            return Ok(None);
        }

        // Active and quarantined storefronts are still eligible in the store.
        let limit = active.jobs.len() + active.quarantined.len() + 1;
        let candidates = self.store.eligible_storefronts(limit).await?;
        let Some(storefront) = candidates
            .into_iter()
            .find(|s| !active.jobs.contains_key(&s.id) && !active.quarantined.contains(&s.id))
        else {
            tracing::debug!(target: "scheduler", "No eligible storefronts left");
            return Ok(None);
        };

        let id = storefront.id;
        active.jobs.insert(
            id,
            HarvestJob {
                storefront_id: id,
                started_at: Utc::now(),
            },
        );
        tracing::info!(
            target: "scheduler",
            "Admitted storefront {} ('{}'), {}/{} active",
            id,
            storefront.name,
            active.jobs.len(),
            self.max_concurrency
        );
        self.events.publish(HarvestEvent::JobAdmitted {
            storefront_id: id,
            base_url: storefront.base_url.clone().unwrap_or_default(),
            active: active.jobs.len(),
        });

        tokio::spawn(self.clone().run_job(storefront));
        Ok(Some(id))
    }

    fn run_job(self: Arc<Self>, storefront: Storefront) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let id = storefront.id;
            let progress = JobProgress::new(&self.events, id);
            let job = process_storefront(
                &self.harvester,
                self.classifier.as_deref(),
                self.classifier_timeout,
                &storefront,
                Some(progress),
            );

            let outcome = match AssertUnwindSafe(job).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic_info) => {
                    let panic_msg = extract_panic_message(&*panic_info);
                    tracing::error!(target: "scheduler", "Harvest of storefront {} panicked: {}", id, panic_msg);
                    JobOutcome {
                        error: Some(format!("harvest crashed: {}", panic_msg)),
                        ..JobOutcome::default()
                    }
                }
            };

            self.finish(id, outcome).await;
        })
    }

    /// Persist, release, then admit the next storefront.
    async fn finish(self: &Arc<Self>, id: StorefrontId, outcome: JobOutcome) {
        let saved = self
            .store
            .save_harvest_result(
                id,
                &outcome.relevant_emails,
                &outcome.raw_emails,
                outcome.error.as_deref(),
            )
            .await;

        let mut active = self.active.lock().await;
        active.jobs.remove(&id);
        if let Err(e) = &saved {
            tracing::error!(
                target: "scheduler",
                "Failed to persist result of storefront {}, quarantining it: {}",
                id,
                e
            );
            active.quarantined.insert(id);
        }

        self.events.publish(HarvestEvent::JobFinished {
            storefront_id: id,
            relevant: outcome.relevant_emails.len(),
            raw: outcome.raw_emails.len(),
            error: outcome.error.clone(),
        });

        if let Err(e) = self.admit_locked(&mut active).await {
            tracing::warn!(target: "scheduler", "Could not admit after storefront {} finished: {}", id, e);
        }
        if active.jobs.is_empty() {
            tracing::info!(target: "scheduler", "All harvests finished");
            self.idle.notify_waiters();
        }
    }
}

fn extract_panic_message(panic_info: &(dyn Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{FetchedPage, PageFetcher};
    use crate::models::{ReviewRecord, StoreStatistics, StorefrontStatus};
    use crate::store::JsonStore;
    use crate::store::tests::review;
    use async_trait::async_trait;
    use url::Url;

    /// Serves one mailto per host after a short pause; panics for `boom.example`.
    struct SlowFetcher;

    #[async_trait]
    impl PageFetcher for SlowFetcher {
        async fn fetch(&self, url: &Url) -> FetchedPage {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let host = url.host_str().unwrap_or_default().to_string();
            if host == "boom.example" {
                panic!("extractor blew up on {}", host);
            }
            if url.path() != "/" {
                return FetchedPage::failed(url, Some(404));
            }
            FetchedPage {
                body: Some(format!(r#"<a href="mailto:info@{}">mail</a>"#, host)),
                final_url: url.clone(),
                status: Some(200),
            }
        }
    }

    fn scheduler_with(store: Arc<dyn StorefrontStore>, capacity: usize) -> Arc<Scheduler> {
        let config = Config {
            max_concurrency: capacity,
            max_pages: 1,
            request_delay: Duration::ZERO,
            ..Config::default()
        };
        let harvester = Harvester::new(Arc::new(SlowFetcher), &config);
        Scheduler::new(store, harvester, None, &config, EventBus::new(4096))
    }

    async fn seeded_store(hosts: &[&str]) -> Arc<JsonStore> {
        let store = Arc::new(JsonStore::in_memory());
        for host in hosts {
            store
                .add_storefront(&review(host, Some(&format!("https://{}", host))))
                .await
                .unwrap();
        }
        store
    }

    async fn wait_idle(scheduler: &Scheduler) {
        tokio::time::timeout(Duration::from_secs(10), scheduler.wait_idle())
            .await
            .expect("scheduler did not go idle");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admits_never_exceed_capacity_or_duplicate() {
        let hosts: Vec<String> = (0..20).map(|i| format!("shop{}.example", i)).collect();
        let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
        let store = seeded_store(&host_refs).await;
        let scheduler = scheduler_with(store.clone(), 3);
        let mut rx = scheduler.events().subscribe();

        let admits = (0..50).map(|_| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.admit().await })
        });
        let results = futures::future::join_all(admits).await;
        let admitted: Vec<StorefrontId> = results
            .into_iter()
            .filter_map(|r| r.unwrap().unwrap())
            .collect();
        assert!(!admitted.is_empty());
        assert!(scheduler.active_jobs().await.len() <= 3);

        wait_idle(&scheduler).await;

        let mut admissions: HashMap<StorefrontId, usize> = HashMap::new();
        let mut finished = HashSet::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                HarvestEvent::JobAdmitted { storefront_id, active, .. } => {
                    assert!(active <= 3, "{} active jobs", active);
                    *admissions.entry(storefront_id).or_default() += 1;
                }
                HarvestEvent::JobFinished { storefront_id, .. } => {
                    finished.insert(storefront_id);
                }
                _ => {}
            }
        }
        assert_eq!(admissions.len(), 20);
        assert!(admissions.values().all(|&n| n == 1), "{:?}", admissions);
        assert_eq!(finished.len(), 20);

        let stats = store.statistics(None).await.unwrap();
        assert_eq!(
            stats,
            StoreStatistics {
                total: 20,
                emails_found: 20,
                total_emails: 20,
                ..StoreStatistics::default()
            }
        );
    }

    #[tokio::test]
    async fn test_admit_returns_none_when_full_or_empty() {
        let store = seeded_store(&["a.example", "b.example"]).await;
        let scheduler = scheduler_with(store, 1);

        assert!(scheduler.admit().await.unwrap().is_some());
        assert_eq!(scheduler.admit().await.unwrap(), None);
        assert_eq!(scheduler.active_jobs().await.len(), 1);

        wait_idle(&scheduler).await;
        assert_eq!(scheduler.admit().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_panicking_harvest_is_isolated() {
        let store = seeded_store(&["boom.example", "good.example"]).await;
        let scheduler = scheduler_with(store.clone(), 2);

        assert_eq!(scheduler.top_off().await.unwrap(), 2);
        wait_idle(&scheduler).await;

        let all = store.list_storefronts(None, None).await.unwrap();
        let boom = all.iter().find(|s| s.name == "boom.example").unwrap();
        let good = all.iter().find(|s| s.name == "good.example").unwrap();

        assert_eq!(boom.status, StorefrontStatus::HarvestError);
        assert!(boom.last_error.as_deref().unwrap().contains("extractor blew up"));
        assert_eq!(good.status, StorefrontStatus::EmailsFound);
        assert_eq!(good.relevant_emails, vec!["info@good.example"]);
        assert!(scheduler.active_jobs().await.is_empty());
        assert_eq!(scheduler.admit().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_completion_admits_next_without_external_trigger() {
        let store = seeded_store(&["a.example", "b.example", "c.example"]).await;
        let scheduler = scheduler_with(store.clone(), 1);

        assert!(scheduler.admit().await.unwrap().is_some());
        wait_idle(&scheduler).await;

        assert_eq!(store.statistics(None).await.unwrap().emails_found, 3);
    }

    /// Delegates to a [`JsonStore`] but refuses to save one storefront.
    struct StubbornStore {
        inner: JsonStore,
        refuse: StorefrontId,
    }

    #[async_trait]
    impl StorefrontStore for StubbornStore {
        async fn eligible_storefronts(&self, limit: usize) -> Result<Vec<Storefront>> {
            self.inner.eligible_storefronts(limit).await
        }
        async fn get_storefront(&self, id: StorefrontId) -> Result<Option<Storefront>> {
            self.inner.get_storefront(id).await
        }
        async fn save_harvest_result(
            &self,
            id: StorefrontId,
            relevant: &[String],
            raw: &[String],
            error: Option<&str>,
        ) -> Result<()> {
            if id == self.refuse {
                return Err(std::io::Error::other("disk full").into());
            }
            self.inner.save_harvest_result(id, relevant, raw, error).await
        }
        async fn add_storefront(&self, record: &ReviewRecord) -> Result<Storefront> {
            self.inner.add_storefront(record).await
        }
        async fn list_storefronts(
            &self,
            status: Option<StorefrontStatus>,
            app_name: Option<&str>,
        ) -> Result<Vec<Storefront>> {
            self.inner.list_storefronts(status, app_name).await
        }
        async fn pending_url_storefronts(&self, limit: Option<usize>) -> Result<Vec<Storefront>> {
            self.inner.pending_url_storefronts(limit).await
        }
        async fn set_base_url(&self, id: StorefrontId, url: &str, verified: bool) -> Result<Storefront> {
            self.inner.set_base_url(id, url, verified).await
        }
        async fn skip_storefront(&self, id: StorefrontId) -> Result<Storefront> {
            self.inner.skip_storefront(id).await
        }
        async fn statistics(&self, app_name: Option<&str>) -> Result<StoreStatistics> {
            self.inner.statistics(app_name).await
        }
    }

    #[tokio::test]
    async fn test_unpersistable_storefront_is_not_readmitted() {
        let inner = JsonStore::in_memory();
        let stuck = inner.add_storefront(&review("Stuck", Some("https://stuck.example"))).await.unwrap();
        inner.add_storefront(&review("Fine", Some("https://fine.example"))).await.unwrap();
        let store = Arc::new(StubbornStore {
            inner,
            refuse: stuck.id,
        });
        let scheduler = scheduler_with(store.clone(), 1);
        let mut rx = scheduler.events().subscribe();

        scheduler.top_off().await.unwrap();
        wait_idle(&scheduler).await;

        let mut admitted = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let HarvestEvent::JobAdmitted { storefront_id, .. } = event {
                admitted.push(storefront_id);
            }
        }
        assert_eq!(admitted.iter().filter(|&&id| id == stuck.id).count(), 1);
        assert_eq!(admitted.len(), 2);
        assert_eq!(scheduler.admit().await.unwrap(), None);
    }
}
