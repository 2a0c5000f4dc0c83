//! Defines the core data structures used in the storefront-sleuth application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Identifier of a storefront row in the store.
pub(crate) type StorefrontId = i64;

/// Lifecycle of a storefront as persisted by the store.
///
/// `harvesting` is deliberately absent: a running harvest only exists as
/// membership in the scheduler's active set.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StorefrontStatus {
    PendingUrl,
    UrlFound,
    UrlVerified,
    EmailsFound,
    HarvestError,
    Skipped,
}

impl StorefrontStatus {
    /// Statuses from which a storefront may be admitted for harvesting.
    pub(crate) fn is_harvestable(self) -> bool {
        matches!(self, Self::UrlFound | Self::UrlVerified)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::PendingUrl => "pending_url",
            Self::UrlFound => "url_found",
            Self::UrlVerified => "url_verified",
            Self::EmailsFound => "emails_found",
            Self::HarvestError => "harvest_error",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StorefrontStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StorefrontStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_url" => Ok(Self::PendingUrl),
            "url_found" => Ok(Self::UrlFound),
            "url_verified" => Ok(Self::UrlVerified),
            "emails_found" => Ok(Self::EmailsFound),
            "harvest_error" => Ok(Self::HarvestError),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown storefront status '{}'", other)),
        }
    }
}

/// A merchant's online shop, as known to the store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct Storefront {
    pub id: StorefrontId,
    /// Shop name as shown on the review platform.
    pub name: String,
    /// Country reported alongside the review, if any.
    #[serde(default)]
    pub country: Option<String>,
    /// App whose reviews surfaced this storefront.
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub review_date: Option<String>,
    #[serde(default)]
    pub review_text: Option<String>,
    /// How long the merchant had used the app when reviewing, as listed.
    #[serde(default)]
    pub usage_duration: Option<String>,
    /// Resolved storefront origin; `None` until someone finds it.
    #[serde(default)]
    pub base_url: Option<String>,
    pub status: StorefrontStatus,
    /// Every address the harvester kept after filtering.
    #[serde(default)]
    pub raw_emails: Vec<String>,
    /// The subset the classifier judged relevant (all of `raw_emails` on fail-open).
    #[serde(default)]
    pub relevant_emails: Vec<String>,
    /// Diagnostic from the last failed harvest.
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub emails_scraped_at: Option<DateTime<Utc>>,
}

impl Storefront {
    /// True when the admission controller may pick this storefront up.
    pub(crate) fn is_eligible(&self) -> bool {
        self.status.is_harvestable()
            && self.base_url.as_deref().is_some_and(|u| !u.trim().is_empty())
            && self.raw_emails.is_empty()
            && self.relevant_emails.is_empty()
    }
}

/// A review record handed over by the review-listing scraper.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub(crate) struct ReviewRecord {
    #[serde(alias = "name")]
    pub store_name: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default, alias = "url")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub review_date: Option<String>,
    #[serde(default)]
    pub review_text: Option<String>,
    #[serde(default)]
    pub usage_duration: Option<String>,
}

/// How a candidate page entered the plan.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DiscoveredVia {
    FixedList,
    Sitemap,
}

/// One page the harvester intends to visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PageCandidate {
    pub url: Url,
    pub discovered_via: DiscoveredVia,
}

/// Per-harvest diagnostics.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HarvestStats {
    /// Candidate pages produced by the planner.
    pub discovered: usize,
    /// Pages that returned a body.
    pub scraped: usize,
    /// Pages that returned nothing (network error, timeout, HTTP >= 400).
    pub failed: usize,
    /// Pages on which at least one address was found.
    pub with_emails: usize,
}

/// What the harvester returns for one storefront.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub(crate) struct HarvestReport {
    /// Filtered addresses, sorted deterministically.
    pub raw_emails: Vec<String>,
    pub stats: HarvestStats,
}

/// One address the classifier accepted, with its justification.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct ClassifiedEmail {
    pub email: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ClassificationStats {
    pub input: usize,
    pub relevant: usize,
    pub rejected: usize,
}

/// Result of running the relevance classifier over a harvest.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub(crate) struct ClassificationResult {
    pub relevant: Vec<ClassifiedEmail>,
    pub stats: ClassificationStats,
}

impl ClassificationResult {
    pub(crate) fn emails(&self) -> Vec<String> {
        self.relevant.iter().map(|e| e.email.clone()).collect()
    }
}

/// Final outcome of one storefront job, ready to be persisted.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub(crate) struct JobOutcome {
    pub relevant_emails: Vec<String>,
    pub raw_emails: Vec<String>,
    /// Human-readable diagnostic when the job failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stats: HarvestStats,
    /// True when the classifier was skipped or failed and all raw addresses were kept.
    pub classifier_fallback: bool,
}

/// A storefront harvest currently running. Lives only in the scheduler's active set.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub(crate) struct HarvestJob {
    pub storefront_id: StorefrontId,
    pub started_at: DateTime<Utc>,
}

/// Aggregate counters over the store.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StoreStatistics {
    pub total: usize,
    pub pending_url: usize,
    pub url_found: usize,
    pub url_verified: usize,
    pub emails_found: usize,
    pub harvest_error: usize,
    pub skipped: usize,
    pub total_emails: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storefront(status: StorefrontStatus, base_url: Option<&str>) -> Storefront {
        let now = Utc::now();
        Storefront {
            id: 1,
            name: "Shop".to_string(),
            country: None,
            app_name: None,
            review_date: None,
            review_text: None,
            usage_duration: None,
            base_url: base_url.map(str::to_string),
            status,
            raw_emails: vec![],
            relevant_emails: vec![],
            last_error: None,
            created_at: now,
            updated_at: now,
            emails_scraped_at: None,
        }
    }

    #[test]
    fn test_eligibility_requires_url_and_status() {
        assert!(storefront(StorefrontStatus::UrlVerified, Some("https://a.shop")).is_eligible());
        assert!(storefront(StorefrontStatus::UrlFound, Some("https://a.shop")).is_eligible());
        assert!(!storefront(StorefrontStatus::PendingUrl, Some("https://a.shop")).is_eligible());
        assert!(!storefront(StorefrontStatus::UrlVerified, None).is_eligible());
        assert!(!storefront(StorefrontStatus::UrlVerified, Some("  ")).is_eligible());
    }

    #[test]
    fn test_eligibility_excludes_already_harvested() {
        let mut s = storefront(StorefrontStatus::UrlVerified, Some("https://a.shop"));
        s.raw_emails.push("hi@a.shop".to_string());
        assert!(!s.is_eligible());
    }

    #[test]
    fn test_review_record_accepts_scraper_field_names() {
        let record: ReviewRecord = serde_json::from_str(
            r#"{"name": "Shop", "url": "shop.example", "review_date": "2024-03-01",
                "review_text": "Great app", "usage_duration": "2 months"}"#,
        )
        .unwrap();
        assert_eq!(record.store_name, "Shop");
        assert_eq!(record.base_url.as_deref(), Some("shop.example"));
        assert_eq!(record.usage_duration.as_deref(), Some("2 months"));
        assert_eq!(record.app_name, None);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            StorefrontStatus::PendingUrl,
            StorefrontStatus::UrlFound,
            StorefrontStatus::UrlVerified,
            StorefrontStatus::EmailsFound,
            StorefrontStatus::HarvestError,
            StorefrontStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<StorefrontStatus>(), Ok(status));
        }
        assert!("harvesting".parse::<StorefrontStatus>().is_err());
    }
}
