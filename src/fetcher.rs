//! Single-page HTTP fetching.
//!
//! A fetch never fails loudly: network errors, timeouts and HTTP statuses
//! >= 400 all come back as a page without a body and are only logged.
//! Retrying is left to [`fetch_with_retries`], which sits above the fetcher.

use crate::config::Config;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use std::time::Duration;
use url::Url;

/// Outcome of one GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FetchedPage {
    /// Response body; `None` on any failure.
    pub body: Option<String>,
    /// URL after redirects, or the requested URL when nothing came back.
    pub final_url: Url,
    /// HTTP status, `None` when no response was received.
    pub status: Option<u16>,
}

impl FetchedPage {
    pub(crate) fn failed(url: &Url, status: Option<u16>) -> Self {
        Self {
            body: None,
            final_url: url.clone(),
            status,
        }
    }

    /// Network errors, 429 and 5xx may succeed on a later attempt; other failures won't.
    pub(crate) fn is_transient_failure(&self) -> bool {
        if self.body.is_some() {
            return false;
        }
        match self.status {
            None => true,
            Some(code) => code == 429 || code >= 500,
        }
    }
}

/// Anything that can retrieve a page for the harvester.
#[async_trait]
pub(crate) trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> FetchedPage;
}

/// [`PageFetcher`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub(crate) struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Builds the client with the configured user agent; redirects are followed.
    pub(crate) fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::Generic(anyhow::anyhow!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            timeout: config.request_timeout,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> FetchedPage {
        tracing::debug!(target: "harvest_task", "Attempting to GET: {}", url);

        let response = match self
            .client
            .get(url.clone())
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.is_timeout() {
                    tracing::warn!(target: "harvest_task", "Timeout fetching {}: {}", url, e);
                } else if e.is_connect() || e.is_request() {
                    tracing::warn!(target: "harvest_task", "Request/Connection error fetching {}: {}", url, e);
                } else {
                    tracing::warn!(target: "harvest_task", "Unexpected error fetching {}: {}", url, e);
                }
                return FetchedPage::failed(url, None);
            }
        };

        let status = response.status();
        let final_url = response.url().clone();
        tracing::debug!(target: "harvest_task", "GET {} status: {}", url, status);

        if status.as_u16() >= 400 {
            if status == reqwest::StatusCode::NOT_FOUND {
                tracing::debug!(target: "harvest_task", "Page not found (404): {}", url);
            } else {
                tracing::warn!(target: "harvest_task", "HTTP error fetching {}: {}", url, status);
            }
            return FetchedPage {
                body: None,
                final_url,
                status: Some(status.as_u16()),
            };
        }

        match response.text().await {
            Ok(body) => FetchedPage {
                body: Some(body),
                final_url,
                status: Some(status.as_u16()),
            },
            Err(e) => {
                tracing::warn!(target: "harvest_task", "Failed to read body from {}: {}", url, e);
                FetchedPage {
                    body: None,
                    final_url,
                    status: None,
                }
            }
        }
    }
}

/// Fetches `url`, retrying transient failures up to `max_retries` more times.
///
/// The delay before retry `n` (starting at 0) is `backoff * 2^n` plus up to
/// 250 ms of jitter.
pub(crate) async fn fetch_with_retries(
    fetcher: &dyn PageFetcher,
    url: &Url,
    max_retries: u32,
    backoff: Duration,
) -> FetchedPage {
    let mut attempt = 0u32;
    loop {
        let page = fetcher.fetch(url).await;
        if attempt >= max_retries || !page.is_transient_failure() {
            return page;
        }

        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=250));
        let delay = backoff.saturating_mul(1u32 << attempt.min(16)) + jitter;
        tracing::debug!(
            target: "harvest_task",
            "Retrying {} in {:?} (attempt {}/{}, status {:?})",
            url,
            delay,
            attempt + 1,
            max_retries,
            page.status
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
