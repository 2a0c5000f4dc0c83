//! Storefront persistence.
//!
//! The pipeline only sees the [`StorefrontStore`] trait. [`JsonStore`] keeps
//! the table in memory behind an async mutex and rewrites a JSON file after
//! every change, so concurrent workers never interleave partial writes.

use crate::domain::clean_store_url;
use crate::error::{AppError, Result};
use crate::models::{ReviewRecord, StoreStatistics, Storefront, StorefrontId, StorefrontStatus};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Storage backend for storefronts. Must tolerate concurrent calls from many workers.
#[async_trait]
pub(crate) trait StorefrontStore: Send + Sync {
    /// Oldest-first storefronts the scheduler may harvest, at most `limit`.
    async fn eligible_storefronts(&self, limit: usize) -> Result<Vec<Storefront>>;

    async fn get_storefront(&self, id: StorefrontId) -> Result<Option<Storefront>>;

    /// Records a finished harvest. An `error` marks the storefront `harvest_error`,
    /// otherwise it becomes `emails_found`; either way it leaves the eligible pool.
    async fn save_harvest_result(
        &self,
        id: StorefrontId,
        relevant_emails: &[String],
        raw_emails: &[String],
        error: Option<&str>,
    ) -> Result<()>;

    /// Adds a storefront for a review, keeping the review context alongside it.
    async fn add_storefront(&self, record: &ReviewRecord) -> Result<Storefront>;

    async fn list_storefronts(
        &self,
        status: Option<StorefrontStatus>,
        app_name: Option<&str>,
    ) -> Result<Vec<Storefront>>;

    /// Oldest-first storefronts still waiting for someone to find their URL.
    async fn pending_url_storefronts(&self, limit: Option<usize>) -> Result<Vec<Storefront>>;

    async fn next_pending_url(&self) -> Result<Option<Storefront>> {
        Ok(self.pending_url_storefronts(Some(1)).await?.into_iter().next())
    }

    /// Sets the storefront URL (`url_verified` when confirmed by a person, else `url_found`).
    ///
    /// Results of an earlier harvest are cleared so the storefront is harvested again.
    async fn set_base_url(&self, id: StorefrontId, url: &str, verified: bool) -> Result<Storefront>;

    async fn skip_storefront(&self, id: StorefrontId) -> Result<Storefront>;

    /// Counters over every storefront, or only those of one app.
    async fn statistics(&self, app_name: Option<&str>) -> Result<StoreStatistics>;
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct StoreData {
    next_id: StorefrontId,
    storefronts: Vec<Storefront>,
}

impl StoreData {
    fn find_mut(&mut self, id: StorefrontId) -> Result<&mut Storefront> {
        self.storefronts
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(AppError::StorefrontNotFound(id))
    }
}

/// JSON-file backed [`StorefrontStore`].
#[derive(Debug)]
pub(crate) struct JsonStore {
    path: Option<PathBuf>,
    data: Mutex<StoreData>,
}

impl JsonStore {
    /// A store that never touches the disk.
    pub(crate) fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(StoreData {
                next_id: 1,
                storefronts: Vec::new(),
            }),
        }
    }

    /// Opens the store at `path`, starting empty when the file does not exist yet.
    pub(crate) async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => StoreData::default(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Store file {} not found, starting empty", path.display());
                StoreData::default()
            }
            Err(e) => return Err(e.into()),
        };
        let data = StoreData {
            next_id: data
                .next_id
                .max(data.storefronts.iter().map(|s| s.id + 1).max().unwrap_or(1)),
            storefronts: data.storefronts,
        };
        tracing::info!(
            "Loaded {} storefronts from {}",
            data.storefronts.len(),
            path.display()
        );
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    async fn flush(&self, data: &StoreData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(data)?;
        let tmp = temp_path(path);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn belongs_to(storefront: &Storefront, app_name: Option<&str>) -> bool {
    app_name.is_none_or(|app| storefront.app_name.as_deref() == Some(app))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl StorefrontStore for JsonStore {
    async fn eligible_storefronts(&self, limit: usize) -> Result<Vec<Storefront>> {
        let data = self.data.lock().await;
        let mut eligible: Vec<Storefront> = data
            .storefronts
            .iter()
            .filter(|s| s.is_eligible())
            .cloned()
            .collect();
        eligible.sort_by_key(|s| s.id);
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn get_storefront(&self, id: StorefrontId) -> Result<Option<Storefront>> {
        let data = self.data.lock().await;
        Ok(data.storefronts.iter().find(|s| s.id == id).cloned())
    }

    async fn save_harvest_result(
        &self,
        id: StorefrontId,
        relevant_emails: &[String],
        raw_emails: &[String],
        error: Option<&str>,
    ) -> Result<()> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        let storefront = data.find_mut(id)?;
        storefront.relevant_emails = relevant_emails.to_vec();
        storefront.raw_emails = raw_emails.to_vec();
        storefront.last_error = error.map(str::to_string);
        storefront.status = if error.is_some() {
            StorefrontStatus::HarvestError
        } else {
            StorefrontStatus::EmailsFound
        };
        storefront.emails_scraped_at = Some(now);
        storefront.updated_at = now;
        self.flush(&data).await
    }

    async fn add_storefront(&self, record: &ReviewRecord) -> Result<Storefront> {
        let name = record.store_name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("storefront name is empty".to_string()));
        }
        let base_url = match record.base_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => Some(clean_store_url(url)?),
            None => None,
        };

        let mut data = self.data.lock().await;
        let now = Utc::now();
        let storefront = Storefront {
            id: data.next_id.max(1),
            name: name.to_string(),
            country: non_blank(record.country.as_deref()),
            app_name: non_blank(record.app_name.as_deref()),
            review_date: non_blank(record.review_date.as_deref()),
            review_text: non_blank(record.review_text.as_deref()),
            usage_duration: non_blank(record.usage_duration.as_deref()),
            status: if base_url.is_some() {
                StorefrontStatus::UrlFound
            } else {
                StorefrontStatus::PendingUrl
            },
            base_url,
            raw_emails: Vec::new(),
            relevant_emails: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
            emails_scraped_at: None,
        };
        data.next_id = storefront.id + 1;
        data.storefronts.push(storefront.clone());
        self.flush(&data).await?;
        Ok(storefront)
    }

    async fn list_storefronts(
        &self,
        status: Option<StorefrontStatus>,
        app_name: Option<&str>,
    ) -> Result<Vec<Storefront>> {
        let data = self.data.lock().await;
        Ok(data
            .storefronts
            .iter()
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .filter(|s| belongs_to(s, app_name))
            .cloned()
            .collect())
    }

    async fn pending_url_storefronts(&self, limit: Option<usize>) -> Result<Vec<Storefront>> {
        let data = self.data.lock().await;
        let mut pending: Vec<Storefront> = data
            .storefronts
            .iter()
            .filter(|s| s.status == StorefrontStatus::PendingUrl)
            .cloned()
            .collect();
        pending.sort_by_key(|s| s.id);
        if let Some(limit) = limit {
            pending.truncate(limit);
        }
        Ok(pending)
    }

    async fn set_base_url(&self, id: StorefrontId, url: &str, verified: bool) -> Result<Storefront> {
        let cleaned = clean_store_url(url)?;
        let mut data = self.data.lock().await;
        let storefront = data.find_mut(id)?;
        storefront.base_url = Some(cleaned);
        storefront.raw_emails.clear();
        storefront.relevant_emails.clear();
        storefront.last_error = None;
        storefront.emails_scraped_at = None;
        storefront.status = if verified {
            StorefrontStatus::UrlVerified
        } else {
            StorefrontStatus::UrlFound
        };
        storefront.updated_at = Utc::now();
        let updated = storefront.clone();
        self.flush(&data).await?;
        Ok(updated)
    }

    async fn skip_storefront(&self, id: StorefrontId) -> Result<Storefront> {
        let mut data = self.data.lock().await;
        let storefront = data.find_mut(id)?;
        storefront.status = StorefrontStatus::Skipped;
        storefront.updated_at = Utc::now();
        let updated = storefront.clone();
        self.flush(&data).await?;
        Ok(updated)
    }

    async fn statistics(&self, app_name: Option<&str>) -> Result<StoreStatistics> {
        let data = self.data.lock().await;
        let mut stats = StoreStatistics::default();
        for storefront in data.storefronts.iter().filter(|s| belongs_to(s, app_name)) {
            stats.total += 1;
            match storefront.status {
                StorefrontStatus::PendingUrl => stats.pending_url += 1,
                StorefrontStatus::UrlFound => stats.url_found += 1,
                StorefrontStatus::UrlVerified => stats.url_verified += 1,
                StorefrontStatus::EmailsFound => stats.emails_found += 1,
                StorefrontStatus::HarvestError => stats.harvest_error += 1,
                StorefrontStatus::Skipped => stats.skipped += 1,
            }
            stats.total_emails += storefront.relevant_emails.len();
        }
        Ok(stats)
    }
}
