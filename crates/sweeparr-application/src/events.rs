// SPDX-License-Identifier: GPL-3.0-or-later
use std::sync::{Arc, Mutex};

use serde_json::json;
use sweeparr_domain::CleanupEvent;
use tracing::debug;

/// Sink for events emitted by the download cleaner.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &CleanupEvent);
}

/// Publisher that only writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventPublisher;

impl EventPublisher for LoggingEventPublisher {
    fn publish(&self, event: &CleanupEvent) {
        debug!(target: "events", name = event.name, payload = ?event.payload, "cleanup event");
    }
}

/// Stores serialized events in memory until drained.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    inner: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieve and clear all captured events
    pub fn drain(&self) -> Vec<serde_json::Value> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *guard)
    }
}

impl EventPublisher for InMemoryEventBus {
    fn publish(&self, event: &CleanupEvent) {
        let value = json!({
            "name": event.name,
            "occurred_at": event.occurred_at,
            "payload": event.payload,
        });
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweeparr_domain::{CleanReason, CleanupEventPayload, DomainEvent};

    #[test]
    fn publish_and_drain_events() {
        let bus = InMemoryEventBus::new();
        assert!(bus.is_empty());

        let event: CleanupEvent = DomainEvent::new(
            "download.cleaned",
            CleanupEventPayload::DownloadCleaned {
                client: "qbit".to_string(),
                hash: "abc".to_string(),
                name: "Show.S01".to_string(),
                category: "tv-sonarr".to_string(),
                reason: CleanReason::MaxRatioReached,
                delete_source_files: true,
            },
        );

        bus.publish(&event);
        assert_eq!(bus.len(), 1);

        let drained = bus.drain();
        assert_eq!(drained.len(), 1);
        let v = &drained[0];
        assert_eq!(v["name"], "download.cleaned");
        assert_eq!(v["payload"]["kind"], "download_cleaned");
        assert_eq!(v["payload"]["reason"], "max_ratio_reached");
        assert!(bus.is_empty());
    }
}
