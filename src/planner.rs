//! Decides which pages of a storefront are worth visiting.

use crate::domain::{page_key, same_host};
use crate::fetcher::PageFetcher;
use crate::models::{DiscoveredVia, PageCandidate};
use quick_xml::Reader;
use quick_xml::events::Event;
use std::collections::HashSet;
use url::Url;

/// High-value paths, in priority order. The first occurrence of a page wins
/// during dedup, so order matters.
pub(crate) const FIXED_TARGETS: [&str; 14] = [
    "/",
    "/contact",
    "/pages/contact",
    "/pages/contact-us",
    "/pages/about",
    "/pages/about-us",
    "/about",
    "/about-us",
    "/policies/privacy-policy",
    "/policies/terms-of-service",
    "/policies/refund-policy",
    "/policies/shipping-policy",
    "/policies/contact-information",
    "/sitemap.xml",
];

/// Sitemap entries are only kept when their URL mentions one of these.
const SITEMAP_KEYWORDS: [&str; 5] = ["contact", "about", "policy", "privacy", "terms"];

/// Builds the ordered candidate page list for one storefront.
#[derive(Debug, Clone)]
pub(crate) struct PagePlanner {
    max_pages: usize,
    sitemap_limit: usize,
}

impl PagePlanner {
    pub(crate) fn new(max_pages: usize, sitemap_limit: usize) -> Self {
        Self {
            max_pages,
            sitemap_limit,
        }
    }

    /// Plans the pages to visit for `base_url`.
    ///
    /// Fetches `/sitemap.xml` once through `fetcher` to discover extra pages,
    /// then dedups, host-filters and caps the combined list.
    pub(crate) async fn plan(&self, fetcher: &dyn PageFetcher, base_url: &Url) -> Vec<PageCandidate> {
        let fixed = fixed_targets(base_url);

        let sitemap_pages = match base_url.join("/sitemap.xml") {
            Ok(sitemap_url) => {
                let page = fetcher.fetch(&sitemap_url).await;
                match page.body {
                    Some(xml) => sitemap_candidates(&xml, self.sitemap_limit),
                    None => {
                        tracing::debug!(target: "harvest_task", "No sitemap at {}", sitemap_url);
                        Vec::new()
                    }
                }
            }
            Err(e) => {
                tracing::warn!(target: "harvest_task", "Cannot build sitemap URL for {}: {}", base_url, e);
                Vec::new()
            }
        };

        let planned = self.finalize(base_url, fixed.into_iter().chain(sitemap_pages));
        tracing::info!(target: "harvest_task", "Will check {} pages for {}", planned.len(), base_url);
        planned
    }

    /// Normalizes, dedups (first occurrence wins), host-filters and caps.
    fn finalize<I>(&self, base_url: &Url, candidates: I) -> Vec<PageCandidate>
    where
        I: IntoIterator<Item = PageCandidate>,
    {
        let mut seen = HashSet::new();
        let mut planned = Vec::new();

        for candidate in candidates {
            if planned.len() >= self.max_pages {
                break;
            }
            let key = page_key(&candidate.url);
            let Ok(url) = Url::parse(&key) else {
                continue;
            };
            if !same_host(&url, base_url) {
                tracing::debug!(target: "harvest_task", "Skipping page on another host: {}", url);
                continue;
            }
            if seen.insert(key) {
                planned.push(PageCandidate {
                    url,
                    discovered_via: candidate.discovered_via,
                });
            }
        }

        planned
    }
}

fn fixed_targets(base_url: &Url) -> Vec<PageCandidate> {
    FIXED_TARGETS
        .iter()
        .filter_map(|path| match base_url.join(path) {
            Ok(url) => Some(PageCandidate {
                url,
                discovered_via: DiscoveredVia::FixedList,
            }),
            Err(e) => {
                tracing::warn!("Failed to join base URL {} with page {}: {}", base_url, path, e);
                None
            }
        })
        .collect()
}

/// Keyword-matching `<loc>` entries of a sitemap, at most `limit` of them.
fn sitemap_candidates(xml: &str, limit: usize) -> Vec<PageCandidate> {
    sitemap_locs(xml)
        .into_iter()
        .filter(|loc| {
            let lower = loc.to_lowercase();
            SITEMAP_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .filter_map(|loc| Url::parse(&loc).ok())
        .take(limit)
        .map(|url| PageCandidate {
            url,
            discovered_via: DiscoveredVia::Sitemap,
        })
        .collect()
}

/// Text of every `<loc>` element. Parsing stops quietly at the first XML error.
pub(crate) fn sitemap_locs(xml: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;

    let mut locs = Vec::new();
    let mut in_loc = false;
    let mut current = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"loc" => {
                in_loc = true;
                current.clear();
            }
            Ok(Event::Text(t)) if in_loc => {
                if let Ok(text) = t.unescape() {
                    current.push_str(&text);
                }
            }
            Ok(Event::CData(c)) if in_loc => {
                current.push_str(&String::from_utf8_lossy(c.as_ref()));
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"loc" => {
                in_loc = false;
                let loc = current.trim();
                if !loc.is_empty() {
                    locs.push(loc.to_string());
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!(target: "harvest_task", "Sitemap parse stopped: {}", e);
                break;
            }
            _ => {}
        }
    }

    locs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchedPage;
    use async_trait::async_trait;

    struct SitemapOnly(Option<String>);

    #[async_trait]
    impl PageFetcher for SitemapOnly {
        async fn fetch(&self, url: &Url) -> FetchedPage {
            FetchedPage {
                body: self.0.clone(),
                final_url: url.clone(),
                status: Some(if self.0.is_some() { 200 } else { 404 }),
            }
        }
    }

    fn sitemap(locs: &[&str]) -> String {
        let entries: String = locs
            .iter()
            .map(|l| format!("<url><loc>{}</loc></url>", l))
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{}</urlset>"#,
            entries
        )
    }

    fn paths(planned: &[PageCandidate]) -> Vec<String> {
        planned.iter().map(|c| c.url.path().to_string()).collect()
    }

    #[tokio::test]
    async fn test_plan_without_sitemap_is_fixed_list() {
        let base = Url::parse("https://shop.example/").unwrap();
        let planned = PagePlanner::new(50, 20).plan(&SitemapOnly(None), &base).await;

        assert_eq!(planned.len(), FIXED_TARGETS.len());
        assert_eq!(planned[0].url.as_str(), "https://shop.example/");
        assert_eq!(planned[1].url.as_str(), "https://shop.example/contact");
        assert!(planned.iter().all(|c| c.discovered_via == DiscoveredVia::FixedList));
    }

    #[tokio::test]
    async fn test_plan_dedups_across_fixed_and_sitemap() {
        let base = Url::parse("https://shop.example").unwrap();
        let xml = sitemap(&[
            "https://shop.example/",
            "https://shop.example/contact/?utm=1",
            "https://shop.example/pages/contact#form",
            "https://shop.example/pages/wholesale-contact?x=1",
            "https://shop.example/pages/wholesale-contact/",
            "https://shop.example/products/mug",
            "https://other.example/pages/about",
        ]);
        let planned = PagePlanner::new(50, 20).plan(&SitemapOnly(Some(xml)), &base).await;

        let keys: Vec<String> = planned.iter().map(|c| page_key(&c.url)).collect();
        let unique: HashSet<&String> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len(), "duplicates in {:?}", keys);

        assert_eq!(planned.len(), FIXED_TARGETS.len() + 1);
        let last = planned.last().unwrap();
        assert_eq!(last.url.as_str(), "https://shop.example/pages/wholesale-contact");
        assert_eq!(last.discovered_via, DiscoveredVia::Sitemap);
        assert!(!paths(&planned).contains(&"/products/mug".to_string()));
        assert!(planned.iter().all(|c| c.url.host_str() == Some("shop.example")));
    }

    #[tokio::test]
    async fn test_plan_respects_cap_and_sitemap_limit() {
        let base = Url::parse("https://shop.example").unwrap();
        let locs: Vec<String> = (0..40)
            .map(|i| format!("https://shop.example/pages/policy-{}", i))
            .collect();
        let loc_refs: Vec<&str> = locs.iter().map(String::as_str).collect();
        let fetcher = SitemapOnly(Some(sitemap(&loc_refs)));

        let planned = PagePlanner::new(50, 20).plan(&fetcher, &base).await;
        assert_eq!(planned.len(), FIXED_TARGETS.len() + 20);

        let capped = PagePlanner::new(5, 20).plan(&fetcher, &base).await;
        assert_eq!(
            paths(&capped),
            vec!["/", "/contact", "/pages/contact", "/pages/contact-us", "/pages/about"]
        );
    }

    #[test]
    fn test_finalize_keeps_first_occurrence_of_root() {
        let base = Url::parse("https://shop.example").unwrap();
        let candidate = |u: &str, via| PageCandidate {
            url: Url::parse(u).unwrap(),
            discovered_via: via,
        };
        let planned = PagePlanner::new(3, 20).finalize(
            &base,
            vec![
                candidate("https://shop.example/", DiscoveredVia::FixedList),
                candidate("https://shop.example/?ref=1", DiscoveredVia::Sitemap),
                candidate("https://shop.example", DiscoveredVia::Sitemap),
                candidate("https://shop.example/pages/about/", DiscoveredVia::Sitemap),
                candidate("https://shop.example/pages/about", DiscoveredVia::FixedList),
                candidate("https://shop.example/policies/terms", DiscoveredVia::Sitemap),
                candidate("https://shop.example/pages/contact", DiscoveredVia::Sitemap),
            ],
        );

        assert_eq!(paths(&planned), vec!["/", "/pages/about", "/policies/terms"]);
        assert_eq!(planned[0].discovered_via, DiscoveredVia::FixedList);
        assert_eq!(planned[1].discovered_via, DiscoveredVia::Sitemap);
    }

    #[test]
    fn test_sitemap_locs_handles_cdata_and_garbage() {
        let xml = "<urlset><url><loc><![CDATA[https://shop.example/pages/about]]></loc></url>\
                   <url><loc> https://shop.example/policies/terms </loc></url><broken";
        assert_eq!(
            sitemap_locs(xml),
            vec![
                "https://shop.example/pages/about".to_string(),
                "https://shop.example/policies/terms".to_string()
            ]
        );
        assert!(sitemap_locs("not xml at all").is_empty());
    }
}
