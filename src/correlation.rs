//! Request/response handoff keyed by generated ids.
//!
//! A caller opens an entry for some context and gets an id back, some other
//! party resolves it, and the caller polls until the value is ready. Reading a
//! ready value removes the entry. Entries nobody collects are dropped by
//! [`CorrelationStore::purge_expired`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolution<C, T> {
    /// Opened but not resolved yet.
    Pending,
    /// Resolved; the entry is gone after this poll.
    Ready { context: C, value: T },
    /// Never opened, already consumed, or expired.
    Unknown,
}

#[derive(Debug)]
struct Entry<C, T> {
    created_at: Instant,
    context: C,
    value: Option<T>,
}

/// Open entries carrying a context `C` fixed at open time and a value `T` supplied later.
#[derive(Debug)]
pub(crate) struct CorrelationStore<C, T> {
    entries: Mutex<HashMap<Uuid, Entry<C, T>>>,
}

impl<C, T> Default for CorrelationStore<C, T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<C: Clone, T> CorrelationStore<C, T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn open(&self, context: C) -> Uuid {
        let id = Uuid::new_v4();
        self.entries.lock().insert(
            id,
            Entry {
                created_at: Instant::now(),
                context,
                value: None,
            },
        );
        id
    }

    /// The context `id` was opened with, while it is still open.
    pub(crate) fn context(&self, id: Uuid) -> Option<C> {
        self.entries.lock().get(&id).map(|entry| entry.context.clone())
    }

    /// Stores `value` for `id`. Returns false when `id` is not open.
    pub(crate) fn resolve(&self, id: Uuid, value: T) -> bool {
        match self.entries.lock().get_mut(&id) {
            Some(entry) => {
                entry.value = Some(value);
                true
            }
            None => false,
        }
    }

    pub(crate) fn poll(&self, id: Uuid) -> Resolution<C, T> {
        let mut entries = self.entries.lock();
        match entries.get(&id) {
            None => Resolution::Unknown,
            Some(entry) if entry.value.is_none() => Resolution::Pending,
            Some(_) => match entries.remove(&id) {
                Some(Entry {
                    context,
                    value: Some(value),
                    ..
                }) => Resolution::Ready { context, value },
                _ => Resolution::Unknown,
            },
        }
    }

    /// Puts a polled resolution back, e.g. when applying it failed.
    ///
    /// The entry keeps its id and starts a fresh expiry window.
    pub(crate) fn restore(&self, id: Uuid, context: C, value: T) {
        self.entries.lock().insert(
            id,
            Entry {
                created_at: Instant::now(),
                context,
                value: Some(value),
            },
        );
    }

    /// Drops entries older than `ttl`, resolved or not. Returns how many went.
    pub(crate) fn purge_expired(&self, ttl: Duration) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.created_at.elapsed() < ttl);
        before - entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
