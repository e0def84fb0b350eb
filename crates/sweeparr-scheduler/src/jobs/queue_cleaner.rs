// SPDX-License-Identifier: GPL-3.0-or-later
//! Periodic sweep of arr download queues.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use sweeparr_application::{ArrClient, ArrError, DownloadService, RemovalPublisher};
use sweeparr_config::{ArrInstanceConfig, QueueCleanerConfig};
use sweeparr_domain::{DeleteReason, DownloadCheckResult, QueueRecord, RemovalRequest, SearchItem};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::job::{Job, JobContext, JobResult, RetryPolicy};

pub struct QueueCleanerJob {
    config: QueueCleanerConfig,
    instances: Vec<ArrInstanceConfig>,
    arr: Arc<dyn ArrClient>,
    clients: Vec<Arc<dyn DownloadService>>,
    removals: Arc<RemovalPublisher>,
}

impl QueueCleanerJob {
    pub fn new(
        config: QueueCleanerConfig,
        instances: Vec<ArrInstanceConfig>,
        arr: Arc<dyn ArrClient>,
        clients: Vec<Arc<dyn DownloadService>>,
        removals: Arc<RemovalPublisher>,
    ) -> Self {
        Self {
            config,
            instances,
            arr,
            clients,
            removals,
        }
    }

    async fn clean_instance(&self, instance: &ArrInstanceConfig) -> Result<(), ArrError> {
        let records = self.fetch_queue(instance).await?;
        for (download_id, records) in group_by_download(records) {
            self.process_download(instance, &download_id, records).await;
        }
        Ok(())
    }

    /// Reads the whole queue before anything is removed, so deletions cannot shift
    /// unread records onto pages that were already fetched.
    async fn fetch_queue(&self, instance: &ArrInstanceConfig) -> Result<Vec<QueueRecord>, ArrError> {
        let mut records = Vec::new();
        let mut page_number = 1;
        loop {
            let page = self
                .arr
                .fetch_page(instance, page_number, instance.page_size)
                .await?;
            debug!(
                target: "queue_cleaner",
                instance = %instance.name,
                page = page_number,
                records = page.records.len(),
                total = page.total_records,
                "fetched queue page"
            );

            let has_more = page.has_more();
            records.extend(page.records);

            if !has_more {
                return Ok(records);
            }
            page_number += 1;
        }
    }

    async fn process_download(
        &self,
        instance: &ArrInstanceConfig,
        download_id: &str,
        records: Vec<QueueRecord>,
    ) {
        if self
            .config
            .ignored_downloads
            .iter()
            .any(|ignored| ignored.trim().eq_ignore_ascii_case(download_id))
        {
            info!(target: "queue_cleaner", instance = %instance.name, download_id, "download is ignored");
            return;
        }

        let records: Vec<QueueRecord> = records
            .into_iter()
            .filter(|record| {
                let valid = self.arr.is_record_valid(instance.instance_type, record);
                if !valid {
                    debug!(target: "queue_cleaner", instance = %instance.name, queue_id = record.id, "skipping invalid record");
                }
                valid
            })
            .collect();
        let Some(record) = records.first() else {
            return;
        };

        if self.removals.is_pending(download_id, &instance.url) {
            debug!(target: "queue_cleaner", instance = %instance.name, download_id, "removal already pending");
            return;
        }

        let mut check = DownloadCheckResult::default();
        if record.is_torrent() && !self.clients.is_empty() {
            check = self.check_clients(download_id).await;
            if !check.found {
                warn!(
                    target: "queue_cleaner",
                    instance = %instance.name,
                    download_id,
                    title = %record.title,
                    "download not found in any download client"
                );
                return;
            }
        }

        if !check.should_remove {
            let failed_import = &self.config.failed_import;
            match self
                .arr
                .should_remove_from_queue(
                    instance.instance_type,
                    record,
                    check.is_private,
                    failed_import.max_strikes,
                )
                .await
            {
                Ok(true) => {
                    check.should_remove = true;
                    check.delete_reason = DeleteReason::FailedImport;
                    check.delete_from_client = !check.is_private || failed_import.delete_private;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        target: "queue_cleaner",
                        instance = %instance.name,
                        download_id,
                        error = %err,
                        "failed import check failed"
                    );
                    return;
                }
            }
        }

        if !check.should_remove {
            return;
        }

        let Some(search_item) =
            SearchItem::for_records(instance.instance_type, instance.version, &records)
        else {
            warn!(target: "queue_cleaner", instance = %instance.name, download_id, "no search identity for download");
            return;
        };

        let request = RemovalRequest {
            id: Uuid::new_v4(),
            instance_type: instance.instance_type,
            instance_name: instance.name.clone(),
            instance_url: instance.url.clone(),
            record: record.clone(),
            search_item,
            is_pack: records.len() > 1,
            remove_from_client: check.delete_from_client,
            delete_reason: check.delete_reason,
        };

        if let Err(err) = self.removals.publish(request).await {
            warn!(
                target: "queue_cleaner",
                instance = %instance.name,
                download_id,
                error = %err,
                "failed to publish removal"
            );
        }
    }

    /// Ask each client in turn until one knows the download.
    async fn check_clients(&self, download_id: &str) -> DownloadCheckResult {
        for client in &self.clients {
            match client
                .should_remove_from_arr_queue(download_id, &self.config.ignored_downloads)
                .await
            {
                Ok(result) if result.found => return result,
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        target: "queue_cleaner",
                        client = client.name(),
                        hash = download_id,
                        error = %err,
                        "download check failed"
                    );
                }
            }
        }
        DownloadCheckResult::not_found()
    }
}

/// Records sharing a download id, in first-seen order.
fn group_by_download(records: Vec<QueueRecord>) -> Vec<(String, Vec<QueueRecord>)> {
    let mut groups: Vec<(String, Vec<QueueRecord>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        if record.download_id.trim().is_empty() {
            continue;
        }
        let key = record.download_id.to_lowercase();
        match index.get(&key) {
            Some(&position) => groups[position].1.push(record),
            None => {
                index.insert(key, groups.len());
                groups.push((record.download_id.clone(), vec![record]));
            }
        }
    }

    groups
}

#[async_trait::async_trait]
impl Job for QueueCleanerJob {
    fn job_type(&self) -> &'static str {
        "queue_cleaner"
    }

    fn name(&self) -> String {
        "Queue Cleaner".to_string()
    }

    async fn execute(&self, ctx: JobContext) -> Result<JobResult> {
        if !self.config.enabled {
            return Ok(JobResult::Skipped {
                reason: "queue cleaner disabled".to_string(),
            });
        }

        info!(target: "queue_cleaner", run_id = %ctx.run_id, instances = self.instances.len(), "queue cleaner started");

        let mut failed = Vec::new();
        for instance in self.instances.iter().filter(|instance| instance.enabled) {
            if let Err(err) = self.clean_instance(instance).await {
                error!(target: "queue_cleaner", instance = %instance.name, error = %err, "failed to clean queue");
                failed.push(instance.name.clone());
            }
        }

        if failed.is_empty() {
            info!(target: "queue_cleaner", run_id = %ctx.run_id, "queue cleaner finished");
            Ok(JobResult::Success)
        } else {
            Ok(JobResult::Failure {
                error: format!("queue cleaning failed for: {}", failed.join(", ")),
                retry: false,
            })
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::NONE
    }
}
