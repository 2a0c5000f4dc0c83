//! Functions for processing individual storefronts.

use crate::classifier::{RelevanceClassifier, classify_or_fail_open};
use crate::events::JobProgress;
use crate::harvester::Harvester;
use crate::models::{JobOutcome, Storefront};
use std::time::Duration;

/// Harvests one storefront and classifies the result.
///
/// # Arguments
/// * `harvester` - Shared harvester holding the fetcher and crawl settings.
/// * `classifier` - Optional relevance classifier; `None` keeps every raw address.
/// * `classifier_timeout` - Upper bound on the classifier call, if any.
/// * `storefront` - Snapshot of the storefront to harvest. Never mutated.
/// * `progress` - Optional observer for page-level events.
///
/// # Returns
/// * `JobOutcome` ready to be persisted. Failures are reported in `error`, not returned.
pub(crate) async fn process_storefront(
    harvester: &Harvester,
    classifier: Option<&dyn RelevanceClassifier>,
    classifier_timeout: Option<Duration>,
    storefront: &Storefront,
    progress: Option<JobProgress<'_>>,
) -> JobOutcome {
    let task_id = format!("Storefront: {} | {}", storefront.id, storefront.name);
    tracing::info!(target: "harvest_task", "[{}] Starting processing.", task_id);

    let Some(base_url) = storefront.base_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        let reason = "Missing base URL".to_string();
        tracing::warn!(target: "harvest_task", "[{}] Skipping storefront. Reason: {}", task_id, reason);
        return JobOutcome {
            error: Some(reason),
            ..JobOutcome::default()
        };
    };

    let outcome = harvest_and_classify(
        harvester,
        classifier,
        classifier_timeout,
        base_url,
        &storefront.name,
        progress,
    )
    .await;

    match &outcome.error {
        Some(error) => tracing::error!(target: "harvest_task", "[{}] !!! {}", task_id, error),
        None if outcome.relevant_emails.is_empty() => {
            tracing::info!(target: "harvest_task", "[{}] ✗ No emails found.", task_id)
        }
        None => tracing::info!(
            target: "harvest_task",
            "[{}] ✓ {} relevant of {} raw emails: {}",
            task_id,
            outcome.relevant_emails.len(),
            outcome.raw_emails.len(),
            outcome.relevant_emails.join(", ")
        ),
    }
    outcome
}

/// Harvests `base_url` and runs the fail-open classification step.
pub(crate) async fn harvest_and_classify(
    harvester: &Harvester,
    classifier: Option<&dyn RelevanceClassifier>,
    classifier_timeout: Option<Duration>,
    base_url: &str,
    store_name: &str,
    progress: Option<JobProgress<'_>>,
) -> JobOutcome {
    let report = match harvester.harvest(base_url, store_name, progress).await {
        Ok(report) => report,
        Err(e) => {
            return JobOutcome {
                error: Some(format!("Harvest failed: {}", e)),
                ..JobOutcome::default()
            };
        }
    };

    let relevance =
        classify_or_fail_open(classifier, classifier_timeout, &report.raw_emails, base_url, store_name).await;

    if let (Some(reason), Some(p)) = (&relevance.fallback, progress) {
        if classifier.is_some() {
            tracing::debug!(
                target: "harvest_task",
                "Storefront {} fell back to raw emails",
                p.storefront_id()
            );
            p.classifier_fallback(reason);
        }
    }

    JobOutcome {
        classifier_fallback: relevance.fallback.is_some(),
        relevant_emails: relevance.emails,
        raw_emails: report.raw_emails,
        error: None,
        stats: report.stats,
    }
}
