//! Progress events pushed by the scheduler and harvester.
//!
//! Publishers never wait on subscribers: a slow subscriber lags and loses the
//! oldest events, and publishing with no subscriber is a no-op.

use crate::models::StorefrontId;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub(crate) enum HarvestEvent {
    JobAdmitted {
        storefront_id: StorefrontId,
        base_url: String,
        active: usize,
    },
    PagesPlanned {
        storefront_id: StorefrontId,
        pages: usize,
    },
    PageVisited {
        storefront_id: StorefrontId,
        url: String,
        ok: bool,
        emails: usize,
    },
    ClassifierFallback {
        storefront_id: StorefrontId,
        reason: String,
    },
    JobFinished {
        storefront_id: StorefrontId,
        relevant: usize,
        raw: usize,
        error: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<HarvestEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<HarvestEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn publish(&self, event: HarvestEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Observer handed to one storefront's harvest so page-level progress reaches the bus.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JobProgress<'a> {
    bus: &'a EventBus,
    storefront_id: StorefrontId,
}

impl<'a> JobProgress<'a> {
    pub(crate) fn new(bus: &'a EventBus, storefront_id: StorefrontId) -> Self {
        Self { bus, storefront_id }
    }

    pub(crate) fn storefront_id(&self) -> StorefrontId {
        self.storefront_id
    }

    pub(crate) fn pages_planned(&self, pages: usize) {
        self.bus.publish(HarvestEvent::PagesPlanned {
            storefront_id: self.storefront_id,
            pages,
        });
    }

    pub(crate) fn page_visited(&self, url: &str, ok: bool, emails: usize) {
        self.bus.publish(HarvestEvent::PageVisited {
            storefront_id: self.storefront_id,
            url: url.to_string(),
            ok,
            emails,
        });
    }

    pub(crate) fn classifier_fallback(&self, reason: &str) {
        self.bus.publish(HarvestEvent::ClassifierFallback {
            storefront_id: self.storefront_id,
            reason: reason.to_string(),
        });
    }
}
