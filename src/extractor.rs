//! Pulls candidate email addresses out of fetched page content.
//!
//! Four independent strategies run over every page and their results are unioned:
//! `mailto:` links, Cloudflare-style obfuscated addresses, a free-text scan
//! (plain and de-obfuscated), and a walk over embedded JSON-LD. None of them can
//! fail the page; malformed markup simply contributes fewer matches.

use crate::emails::{EMAIL_REGEX, EmailSet, is_email};
use once_cell::sync::Lazy;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::{Captures, Regex};
use scraper::{Html, Selector};
use std::borrow::Cow;

static ANCHOR_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("static selector is valid"));
static CFEMAIL_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("[data-cfemail]").expect("static selector is valid"));
static JSONLD_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("static selector is valid")
});

static ENTITY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").expect("valid regex")
});
static AT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*[(\[]\s*at\s*[)\]]\s*|\s+at\s+").expect("valid regex"));
static DOT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*[(\[]\s*dot\s*[)\]]\s*|\s+dot\s+").expect("valid regex"));

const EMAIL_PROTECTION_MARKER: &str = "/cdn-cgi/l/email-protection#";

/// Markup-derived pieces the element-based strategies work on.
#[derive(Debug, Default)]
struct PageParts {
    hrefs: Vec<String>,
    cf_payloads: Vec<String>,
    jsonld_blocks: Vec<String>,
}

/// Extracts every candidate address from one page.
///
/// # Arguments
/// * `body` - The page content as returned by the fetcher.
/// * `base_url` - Final URL of the page; a `.xml` suffix selects the XML parser.
///
/// # Returns
/// * The union of all strategies, in discovery order, deduplicated case-insensitively.
pub(crate) fn extract_emails(body: &str, base_url: &str) -> EmailSet {
    let mut found = EmailSet::new();
    if body.trim().is_empty() {
        return found;
    }

    let parts = if is_xml_like(base_url, body) {
        tracing::debug!(target: "harvest_task", "Parsing {} as XML", base_url);
        collect_xml_parts(body)
    } else {
        collect_html_parts(body)
    };

    let mailto = emails_from_hrefs(&parts.hrefs);
    let obfuscated = emails_from_cf_payloads(&parts.cf_payloads);
    let text = emails_from_text(body);
    let structured = emails_from_jsonld(&parts.jsonld_blocks);

    tracing::debug!(
        target: "harvest_task",
        "{}: mailto={} obfuscated={} text={} jsonld={}",
        base_url,
        mailto.len(),
        obfuscated.len(),
        text.len(),
        structured.len()
    );

    found.extend(mailto);
    found.extend(obfuscated);
    found.extend(text);
    found.extend(structured);
    found
}

/// Sitemaps and other XML documents need an XML-aware parse.
pub(crate) fn is_xml_like(url: &str, body: &str) -> bool {
    let head = body.trim_start();
    url.to_ascii_lowercase().ends_with(".xml")
        || head.starts_with("<?xml")
        || head.starts_with("<urlset")
}

fn collect_html_parts(body: &str) -> PageParts {
    let document = Html::parse_document(body);
    let mut parts = PageParts::default();

    for element in document.select(&ANCHOR_SELECTOR) {
        if let Some(href) = element.value().attr("href") {
            parts.hrefs.push(href.to_string());
        }
    }
    for element in document.select(&CFEMAIL_SELECTOR) {
        if let Some(payload) = element.value().attr("data-cfemail") {
            parts.cf_payloads.push(payload.to_string());
        }
    }
    for element in document.select(&JSONLD_SELECTOR) {
        parts.jsonld_blocks.push(element.text().collect::<String>());
    }

    parts
}

fn collect_xml_parts(body: &str) -> PageParts {
    let mut reader = Reader::from_str(body);
    reader.config_mut().check_end_names = false;

    let mut parts = PageParts::default();
    let mut jsonld: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                inspect_xml_attributes(&e, &mut parts);
                if is_jsonld_script(&e) {
                    jsonld = Some(String::new());
                }
            }
            Ok(Event::Empty(e)) => inspect_xml_attributes(&e, &mut parts),
            Ok(Event::Text(t)) => {
                if let Some(buf) = jsonld.as_mut() {
                    if let Ok(text) = t.unescape() {
                        buf.push_str(&text);
                    }
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(buf) = jsonld.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(c.as_ref()));
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref().eq_ignore_ascii_case(b"script") {
                    if let Some(block) = jsonld.take() {
                        parts.jsonld_blocks.push(block);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!(
                    target: "harvest_task",
                    "Stopping XML walk at byte {}: {}",
                    reader.buffer_position(),
                    e
                );
                break;
            }
            _ => {}
        }
    }

    parts
}

fn inspect_xml_attributes(element: &BytesStart<'_>, parts: &mut PageParts) {
    for attr in element.attributes().flatten() {
        let key = attr.key.local_name();
        let Ok(value) = attr.unescape_value() else {
            continue;
        };
        match key.as_ref() {
            b"href" => parts.hrefs.push(value.into_owned()),
            b"data-cfemail" => parts.cf_payloads.push(value.into_owned()),
            _ => {}
        }
    }
}

fn is_jsonld_script(element: &BytesStart<'_>) -> bool {
    element.local_name().as_ref().eq_ignore_ascii_case(b"script")
        && element.attributes().flatten().any(|attr| {
            attr.key.local_name().as_ref() == b"type"
                && attr
                    .unescape_value()
                    .is_ok_and(|v| v.trim().eq_ignore_ascii_case("application/ld+json"))
        })
}

/// Strategy 1 (`mailto:` links), plus hex payloads hidden in email-protection links.
fn emails_from_hrefs(hrefs: &[String]) -> Vec<String> {
    let mut emails = Vec::new();
    for href in hrefs {
        let href = href.trim();
        if href.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("mailto:")) {
            let email = href[7..].split('?').next().unwrap_or("").trim();
            if is_email(email) {
                emails.push(email.to_string());
            } else if !email.is_empty() {
                tracing::debug!(target: "harvest_task", "Mailto content failed shape check: {}", email);
            }
        } else if let Some(pos) = href.find(EMAIL_PROTECTION_MARKER) {
            let payload = &href[pos + EMAIL_PROTECTION_MARKER.len()..];
            if let Some(email) = decode_cfemail(payload).filter(|e| is_email(e)) {
                emails.push(email);
            }
        }
    }
    emails
}

/// Strategy 2: `data-cfemail` attributes.
fn emails_from_cf_payloads(payloads: &[String]) -> Vec<String> {
    payloads
        .iter()
        .filter_map(|payload| decode_cfemail(payload))
        .filter(|email| is_email(email))
        .collect()
}

/// Reverses the XOR obfuscation: the first hex byte is the key, every following
/// byte is a character XOR-ed with that key.
///
/// Returns `None` for odd lengths, non-hex input or output that isn't UTF-8.
pub(crate) fn decode_cfemail(encoded: &str) -> Option<String> {
    let encoded = encoded.trim();
    if encoded.len() < 4 || encoded.len() % 2 != 0 || !encoded.is_ascii() {
        return None;
    }
    let key = u8::from_str_radix(&encoded[..2], 16).ok()?;
    let bytes = (2..encoded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&encoded[i..i + 2], 16).map(|b| b ^ key))
        .collect::<Result<Vec<u8>, _>>()
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Strategy 3: regex scan over the unescaped text and over a de-obfuscated variant.
fn emails_from_text(body: &str) -> Vec<String> {
    let text = unescape_entities(body);
    let alternate = DOT_REGEX.replace_all(&AT_REGEX.replace_all(&text, "@"), ".").into_owned();

    let mut emails = Vec::new();
    for variant in [&*text, alternate.as_str()] {
        for m in EMAIL_REGEX.find_iter(variant) {
            let email = m.as_str().trim_end_matches(['.', '-']);
            if is_email(email) {
                emails.push(email.to_string());
            }
        }
    }
    emails
}

/// Decodes numeric character references and the few named entities that matter for addresses.
fn unescape_entities(text: &str) -> Cow<'_, str> {
    ENTITY_REGEX.replace_all(text, |caps: &Captures<'_>| {
        decode_entity(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    })
}

fn decode_entity(name: &str) -> Option<String> {
    if let Some(number) = name.strip_prefix('#') {
        let code = match number.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => number.parse::<u32>().ok()?,
        };
        return char::from_u32(code).map(String::from);
    }
    let decoded = match name {
        "amp" => "&",
        "lt" => "<",
        "gt" => ">",
        "quot" => "\"",
        "apos" => "'",
        "nbsp" => " ",
        "commat" => "@",
        "period" => ".",
        _ => return None,
    };
    Some(decoded.to_string())
}

/// Strategy 4: every string leaf of every parseable JSON-LD block.
fn emails_from_jsonld(blocks: &[String]) -> Vec<String> {
    let mut emails = Vec::new();
    for block in blocks {
        match serde_json::from_str::<serde_json::Value>(block.trim()) {
            Ok(value) => walk_json(&value, &mut emails),
            Err(e) => {
                tracing::debug!(target: "harvest_task", "Ignoring unparseable JSON-LD block: {}", e);
            }
        }
    }
    emails
}

fn walk_json(value: &serde_json::Value, emails: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => {
            let s = s.trim();
            let candidate = match s.get(..7) {
                Some(prefix) if prefix.eq_ignore_ascii_case("mailto:") => &s[7..],
                _ => s,
            };
            if is_email(candidate) {
                emails.push(candidate.to_string());
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                walk_json(item, emails);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                walk_json(item, emails);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_cfemail(email: &str, key: u8) -> String {
        let mut out = format!("{:02x}", key);
        for b in email.bytes() {
            out.push_str(&format!("{:02x}", b ^ key));
        }
        out
    }

    fn extracted(body: &str, url: &str) -> Vec<String> {
        extract_emails(body, url).into_vec()
    }

    #[test]
    fn test_decode_cfemail_recovers_original() {
        for key in [0x00u8, 0x2a, 0x7f, 0xff] {
            let encoded = encode_cfemail("orders@shop.example", key);
            assert_eq!(decode_cfemail(&encoded).as_deref(), Some("orders@shop.example"));
        }
    }

    #[test]
    fn test_decode_cfemail_rejects_garbage() {
        assert_eq!(decode_cfemail(""), None);
        assert_eq!(decode_cfemail("2a"), None);
        assert_eq!(decode_cfemail("2a4"), None);
        assert_eq!(decode_cfemail("zz4142"), None);
    }

    #[test]
    fn test_mailto_links_strip_query() {
        let body = r#"<a href="mailto:hi@shop.example?subject=Hello">Email us</a>
                      <a href="MAILTO:Sales@Shop.Example">Sales</a>
                      <a href="mailto:not-an-address">Broken</a>"#;
        let emails = extracted(body, "https://shop.example/contact");
        assert!(emails.contains(&"hi@shop.example".to_string()));
        assert!(emails.contains(&"Sales@Shop.Example".to_string()));
        assert!(!emails.iter().any(|e| e.contains("not-an-address")));
    }

    #[test]
    fn test_cfemail_attribute_and_protection_link() {
        let attr = encode_cfemail("help@shop.example", 0x41);
        let link = encode_cfemail("press@shop.example", 0x13);
        let body = format!(
            r#"<span class="__cf_email__" data-cfemail="{}">[email&#160;protected]</span>
               <a href="/cdn-cgi/l/email-protection#{}">press</a>"#,
            attr, link
        );
        let emails = extracted(&body, "https://shop.example/pages/about");
        assert!(emails.contains(&"help@shop.example".to_string()));
        assert!(emails.contains(&"press@shop.example".to_string()));
    }

    #[test]
    fn test_free_text_with_entities_and_obfuscation() {
        let body = "<p>Write to care&#64;shop.example.</p>\
                    <p>Wholesale: bulk (at) shop (dot) example</p>\
                    <p>Returns: returns [AT] shop [DOT] example</p>";
        let emails = extracted(body, "https://shop.example/");
        assert!(emails.contains(&"care@shop.example".to_string()), "{:?}", emails);
        assert!(emails.contains(&"bulk@shop.example".to_string()), "{:?}", emails);
        assert!(emails.contains(&"returns@shop.example".to_string()), "{:?}", emails);
    }

    #[test]
    fn test_jsonld_walk_finds_nested_strings_and_survives_bad_blocks() {
        let body = r#"<html><head>
            <script type="application/ld+json">{ this is not json </script>
            <script type="application/ld+json">
              {"@context":"https://schema.org","@type":"Organization",
               "contactPoint":[{"@type":"ContactPoint","email":"mailto:support@shop.example"}],
               "sameAs":["owner@shop.example","https://instagram.com/shop"]}
            </script></head><body></body></html>"#;
        let emails = extracted(body, "https://shop.example/");
        assert!(emails.contains(&"support@shop.example".to_string()));
        assert!(emails.contains(&"owner@shop.example".to_string()));
    }

    #[test]
    fn test_strategies_are_unioned_without_duplicates() {
        let body = r#"<a href="mailto:hi@shop.example">hi@shop.example</a> HI@SHOP.EXAMPLE"#;
        assert_eq!(extracted(body, "https://shop.example/"), vec!["hi@shop.example"]);
    }

    #[test]
    fn test_xml_mode_for_sitemaps() {
        assert!(is_xml_like("https://shop.example/sitemap.xml", "<html>"));
        assert!(is_xml_like("https://shop.example/feed", "  <?xml version=\"1.0\"?><rss/>"));
        assert!(is_xml_like("https://shop.example/x", "<urlset></urlset>"));
        assert!(!is_xml_like("https://shop.example/contact", "<!doctype html><html>"));

        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://shop.example/pages/contact</loc></url>
              <note href="mailto:feeds@shop.example"/>
            </urlset>"#;
        let emails = extracted(body, "https://shop.example/sitemap.xml");
        assert_eq!(emails, vec!["feeds@shop.example"]);
    }

    #[test]
    fn test_malformed_xml_still_scans_text() {
        let body = "<?xml version=\"1.0\"?><urlset><loc>contact me: a@shop.example</urlset></broken";
        let emails = extracted(body, "https://shop.example/sitemap.xml");
        assert_eq!(emails, vec!["a@shop.example"]);
    }

    #[test]
    fn test_empty_body_yields_nothing() {
        assert!(extract_emails("   ", "https://shop.example/").is_empty());
    }
}
