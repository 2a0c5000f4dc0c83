//! Utility functions for handling storefront URLs.

use crate::error::{AppError, Result};
use url::Url;

fn with_scheme(website_url_str: &str) -> String {
    if !website_url_str.starts_with("http://") && !website_url_str.starts_with("https://") {
        format!("https://{}", website_url_str)
    } else {
        website_url_str.to_string()
    }
}

/// Parses the input website string into a valid Url object, adding a scheme if necessary.
pub(crate) fn normalize_url(website_url_str: &str) -> Result<Url> {
    let trimmed = website_url_str.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidInput("Website URL is empty".to_string()));
    }
    let url = Url::parse(&with_scheme(trimmed))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AppError::InvalidInput(format!(
            "Website URL has no host: {}",
            website_url_str
        )));
    }
    Ok(url)
}

/// Reduces a storefront URL to its origin (`scheme://host[:port]`) before it is stored.
///
/// # Arguments
/// * `website_url_str` - Anything a person might paste: bare host, product page, URL with tracking query.
///
/// # Returns
/// * `Ok(String)` with the origin, without trailing slash.
/// * `Err(AppError)` if no host can be extracted.
pub(crate) fn clean_store_url(website_url_str: &str) -> Result<String> {
    let url = normalize_url(website_url_str)?;
    let origin = url.origin().ascii_serialization();
    tracing::debug!("Cleaned store URL '{}' to '{}'", website_url_str, origin);
    Ok(origin)
}

/// Dedup key for a page: query and fragment dropped, trailing slash trimmed.
pub(crate) fn page_key(url: &Url) -> String {
    let mut stripped = url.clone();
    stripped.set_query(None);
    stripped.set_fragment(None);
    stripped.as_str().trim_end_matches('/').to_string()
}

/// True when both URLs point at the same host and port.
pub(crate) fn same_host(a: &Url, b: &Url) -> bool {
    a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}
