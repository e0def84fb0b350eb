// SPDX-License-Identifier: GPL-3.0-or-later
//! Delivery of queue removals, at most once per download and instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use sweeparr_config::ArrInstanceConfig;
use sweeparr_domain::RemovalRequest;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::arr::{ArrClient, ArrError};

/// How long a published removal suppresses duplicates for the same download.
const MARKER_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum RemovalError {
    #[error(transparent)]
    Arr(#[from] ArrError),
    #[error("removal sink failed: {0}")]
    Sink(String),
}

#[async_trait]
pub trait RemovalSink: Send + Sync {
    async fn remove(&self, request: &RemovalRequest) -> Result<(), RemovalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    AlreadyPending,
}

type MarkerKey = (String, String);

/// Hands removal requests to a sink, suppressing duplicates per (download id, instance url).
pub struct RemovalPublisher {
    sink: Arc<dyn RemovalSink>,
    markers: Cache<MarkerKey, ()>,
    // Makes marker check-and-set atomic across concurrent publishers.
    guard: Mutex<()>,
}

impl RemovalPublisher {
    pub fn new(sink: Arc<dyn RemovalSink>) -> Self {
        Self::with_ttl(sink, MARKER_TTL)
    }

    pub fn with_ttl(sink: Arc<dyn RemovalSink>, ttl: Duration) -> Self {
        Self {
            sink,
            markers: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(ttl)
                .build(),
            guard: Mutex::new(()),
        }
    }

    fn key(download_id: &str, instance_url: &str) -> MarkerKey {
        (
            download_id.to_lowercase(),
            instance_url.trim_end_matches('/').to_lowercase(),
        )
    }

    pub fn is_pending(&self, download_id: &str, instance_url: &str) -> bool {
        self.markers
            .contains_key(&Self::key(download_id, instance_url))
    }

    /// Publish `request` unless a removal for the same download and instance is already pending.
    ///
    /// A failed delivery clears the marker so a later run can try again.
    pub async fn publish(&self, request: RemovalRequest) -> Result<PublishOutcome, RemovalError> {
        let key = Self::key(&request.record.download_id, &request.instance_url);
        {
            let _lock = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.markers.contains_key(&key) {
                debug!(
                    target: "removal",
                    download_id = %request.record.download_id,
                    instance = %request.instance_name,
                    "removal already pending"
                );
                return Ok(PublishOutcome::AlreadyPending);
            }
            self.markers.insert(key.clone(), ());
        }

        info!(
            target: "removal",
            request_id = %request.id,
            download_id = %request.record.download_id,
            instance = %request.instance_name,
            reason = %request.delete_reason,
            is_pack = request.is_pack,
            remove_from_client = request.remove_from_client,
            "publishing removal"
        );

        if let Err(err) = self.sink.remove(&request).await {
            self.markers.invalidate(&key);
            return Err(err);
        }
        Ok(PublishOutcome::Published)
    }
}

/// Collects requests in memory. Used for dry runs.
#[derive(Clone, Default)]
pub struct InMemoryRemovalSink {
    inner: Arc<Mutex<Vec<RemovalRequest>>>,
}

impl InMemoryRemovalSink {
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

    /// Retrieve and clear all captured requests
    pub fn drain(&self) -> Vec<RemovalRequest> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *guard)
    }
}

#[async_trait]
impl RemovalSink for InMemoryRemovalSink {
    async fn remove(&self, request: &RemovalRequest) -> Result<(), RemovalError> {
        info!(target: "removal", download_id = %request.record.download_id, reason = %request.delete_reason, "dry run removal");
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        Ok(())
    }
}

/// Deletes the queue item in the arr application and triggers a new search.
pub struct ArrRemovalSink {
    client: Arc<dyn ArrClient>,
    instances: HashMap<String, ArrInstanceConfig>,
}

impl ArrRemovalSink {
    pub fn new(client: Arc<dyn ArrClient>, instances: &[ArrInstanceConfig]) -> Self {
        Self {
            client,
            instances: instances
                .iter()
                .map(|instance| (instance.name.clone(), instance.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl RemovalSink for ArrRemovalSink {
    async fn remove(&self, request: &RemovalRequest) -> Result<(), RemovalError> {
        let instance = self
            .instances
            .get(&request.instance_name)
            .ok_or_else(|| ArrError::UnknownInstance(request.instance_name.clone()))?;

        self.client
            .delete_queue_item(instance, &request.record, request.remove_from_client)
            .await?;

        if let Err(err) = self.client.search(instance, &request.search_item).await {
            warn!(
                target: "removal",
                instance = %instance.name,
                download_id = %request.record.download_id,
                error = %err,
                "failed to trigger search after removal"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sweeparr_domain::{DeleteReason, InstanceType, QueueRecord, SearchItem};
    use uuid::Uuid;

    fn request(download_id: &str, instance_url: &str) -> RemovalRequest {
        RemovalRequest {
            id: Uuid::new_v4(),
            instance_type: InstanceType::Radarr,
            instance_name: "radarr".to_string(),
            instance_url: instance_url.to_string(),
            record: QueueRecord {
                id: 1,
                download_id: download_id.to_string(),
                movie_id: Some(9),
                ..QueueRecord::default()
            },
            search_item: SearchItem::Movie { movie_id: 9 },
            is_pack: false,
            remove_from_client: true,
            delete_reason: DeleteReason::Stalled,
        }
    }

    #[tokio::test]
    async fn duplicate_requests_are_suppressed() {
        let sink = InMemoryRemovalSink::new();
        let publisher = RemovalPublisher::new(Arc::new(sink.clone()));

        assert_eq!(
            publisher.publish(request("ABC", "http://radarr:7878")).await.expect("publish"),
            PublishOutcome::Published
        );
        assert!(publisher.is_pending("abc", "http://radarr:7878/"));
        assert_eq!(
            publisher.publish(request("abc", "http://radarr:7878")).await.expect("publish"),
            PublishOutcome::AlreadyPending
        );
        assert_eq!(
            publisher.publish(request("abc", "http://other:7878")).await.expect("publish"),
            PublishOutcome::Published
        );
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishers_deliver_once() {
        let sink = InMemoryRemovalSink::new();
        let publisher = Arc::new(RemovalPublisher::new(Arc::new(sink.clone())));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let publisher = publisher.clone();
                tokio::spawn(async move { publisher.publish(request("race", "http://radarr")).await })
            })
            .collect();

        let mut published = 0;
        for task in tasks {
            if task.await.expect("join").expect("publish") == PublishOutcome::Published {
                published += 1;
            }
        }

        assert_eq!(published, 1);
        assert_eq!(sink.len(), 1);
    }

    struct FailingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemovalSink for FailingSink {
        async fn remove(&self, _request: &RemovalRequest) -> Result<(), RemovalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RemovalError::Sink("unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_delivery_allows_retry() {
        let sink = Arc::new(FailingSink {
            calls: AtomicUsize::new(0),
        });
        let publisher = RemovalPublisher::new(sink.clone());

        assert!(publisher.publish(request("abc", "http://radarr")).await.is_err());
        assert!(!publisher.is_pending("abc", "http://radarr"));
        assert!(publisher.publish(request("abc", "http://radarr")).await.is_err());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }
}
