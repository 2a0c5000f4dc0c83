//! Email-shape matching, case-insensitive deduplication and denylist filtering.

use crate::config::EmailDenylist;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

const EMAIL_PATTERN: &str = r"[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+";

/// Finds email-shaped substrings in free text.
pub(crate) static EMAIL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(EMAIL_PATTERN).expect("email pattern is valid"));

static EMAIL_EXACT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^{}$", EMAIL_PATTERN)).expect("email pattern is valid"));

/// True if the whole string is email-shaped.
pub(crate) fn is_email(candidate: &str) -> bool {
    EMAIL_EXACT_REGEX.is_match(candidate)
}

/// Insertion-ordered set of addresses, deduplicated case-insensitively.
///
/// The first spelling seen is the one kept.
#[derive(Debug, Clone, Default)]
pub(crate) struct EmailSet {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl EmailSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the address was not present yet.
    pub(crate) fn insert(&mut self, email: &str) -> bool {
        if self.seen.insert(email.to_lowercase()) {
            self.ordered.push(email.to_string());
            true
        } else {
            false
        }
    }

    pub(crate) fn extend<I, S>(&mut self, emails: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for email in emails {
            self.insert(email.as_ref());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ordered.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &String> {
        self.ordered.iter()
    }

    pub(crate) fn into_vec(self) -> Vec<String> {
        self.ordered
    }
}

impl<S: AsRef<str>> FromIterator<S> for EmailSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = EmailSet::new();
        set.extend(iter);
        set
    }
}

/// True if the address should be discarded.
pub(crate) fn is_denied(email: &str, denylist: &EmailDenylist) -> bool {
    let lower = email.to_lowercase();
    if denylist
        .blocked_extensions
        .iter()
        .any(|ext| lower.ends_with(ext.as_str()))
    {
        return true;
    }
    let domain = lower.rsplit_once('@').map_or("", |(_, domain)| domain);
    denylist
        .placeholder_patterns
        .iter()
        .any(|pattern| matches_placeholder(&lower, domain, pattern))
}

/// `name@` matches the whole local part, `@domain` or a bare `domain` match
/// that domain and its subdomains.
fn matches_placeholder(email: &str, domain: &str, pattern: &str) -> bool {
    if pattern.ends_with('@') {
        return email.starts_with(pattern);
    }
    let pattern = pattern.trim_start_matches('@');
    !pattern.is_empty()
        && (domain == pattern
            || domain
                .strip_suffix(pattern)
                .is_some_and(|prefix| prefix.ends_with('.')))
}

/// Dedups, drops denied addresses and sorts the remainder deterministically.
///
/// Pure: running it on its own output returns the same list.
pub(crate) fn filter_emails<I, S>(emails: I, denylist: &EmailDenylist) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: EmailSet = emails.into_iter().collect();
    let mut kept: Vec<String> = set
        .into_vec()
        .into_iter()
        .filter(|email| {
            let denied = is_denied(email, denylist);
            if denied {
                tracing::debug!(target: "harvest_task", "Dropping denylisted address: {}", email);
            }
            !denied
        })
        .collect();
    kept.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)));
    kept
}
