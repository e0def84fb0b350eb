// SPDX-License-Identifier: GPL-3.0-or-later
use std::sync::Arc;

use anyhow::Result;
use sweeparr_application::{DownloadService, HardLinkFileService, TorrentItem};
use sweeparr_config::DownloadCleanerConfig;
use tracing::{debug, info, warn};

use crate::job::{Job, JobContext, JobResult, RetryPolicy};

/// Removes seeding downloads past their limits and recategorises orphaned ones.
pub struct DownloadCleanerJob {
    config: DownloadCleanerConfig,
    clients: Vec<Arc<dyn DownloadService>>,
    hard_links: Arc<dyn HardLinkFileService>,
}

impl DownloadCleanerJob {
    pub fn new(
        config: DownloadCleanerConfig,
        clients: Vec<Arc<dyn DownloadService>>,
        hard_links: Arc<dyn HardLinkFileService>,
    ) -> Self {
        Self {
            config,
            clients,
            hard_links,
        }
    }

    fn unlinked_enabled(&self) -> bool {
        let unlinked = &self.config.unlinked;
        unlinked.enabled
            && !unlinked.target_category.trim().is_empty()
            && !unlinked.categories.is_empty()
    }

    async fn populate_link_counts(&self) {
        let dirs = self.config.unlinked.ignored_root_dirs.clone();
        if dirs.is_empty() {
            return;
        }

        let hard_links = self.hard_links.clone();
        if let Err(err) =
            tokio::task::spawn_blocking(move || hard_links.populate_file_counts(&dirs)).await
        {
            warn!(target: "download_cleaner", error = %err, "failed to index ignored root directories");
        }
    }

    async fn change_categories(
        &self,
        downloads: &[(Arc<dyn DownloadService>, Vec<Box<dyn TorrentItem>>)],
    ) -> usize {
        let unlinked = &self.config.unlinked;
        let mut populated = false;
        let mut failures = 0;

        for (client, items) in downloads {
            let candidates = client.filter_downloads_to_change_category(items, &unlinked.categories);
            if candidates.is_empty() {
                debug!(target: "download_cleaner", client = client.name(), "no unlinked candidates");
                continue;
            }

            if let Err(err) = client.create_category(&unlinked.target_category).await {
                warn!(
                    target: "download_cleaner",
                    client = client.name(),
                    category = %unlinked.target_category,
                    error = %err,
                    "failed to create unlinked category"
                );
                failures += 1;
                continue;
            }

            if !populated {
                self.populate_link_counts().await;
                populated = true;
            }

            if let Err(err) = client.change_category_for_no_hard_links(candidates).await {
                warn!(target: "download_cleaner", client = client.name(), error = %err, "failed to change categories");
                failures += 1;
            }
        }

        failures
    }
}

#[async_trait::async_trait]
impl Job for DownloadCleanerJob {
    fn job_type(&self) -> &'static str {
        "download_cleaner"
    }

    fn name(&self) -> String {
        "Download Cleaner".to_string()
    }

    async fn execute(&self, ctx: JobContext) -> Result<JobResult> {
        if !self.config.enabled {
            return Ok(JobResult::Skipped {
                reason: "download cleaner disabled".to_string(),
            });
        }

        info!(target: "download_cleaner", run_id = %ctx.run_id, clients = self.clients.len(), "download cleaner started");

        let mut failures = 0;
        let mut downloads = Vec::with_capacity(self.clients.len());
        for client in &self.clients {
            match client.get_seeding_downloads().await {
                Ok(items) => {
                    debug!(target: "download_cleaner", client = client.name(), count = items.len(), "seeding downloads fetched");
                    downloads.push((client.clone(), items));
                }
                Err(err) => {
                    warn!(target: "download_cleaner", client = client.name(), error = %err, "failed to fetch seeding downloads");
                    failures += 1;
                }
            }
        }

        if !self.config.categories.is_empty() {
            for (client, items) in &mut downloads {
                let to_clean = client.filter_downloads_to_be_cleaned(items, &self.config.categories);
                if to_clean.is_empty() {
                    continue;
                }
                match client.clean_downloads(to_clean, &self.config.categories).await {
                    // Deleted downloads must not reach the unlinked pass.
                    Ok(cleaned) => items.retain(|item| {
                        !cleaned
                            .iter()
                            .any(|hash| hash.eq_ignore_ascii_case(item.hash()))
                    }),
                    Err(err) => {
                        warn!(target: "download_cleaner", client = client.name(), error = %err, "failed to clean downloads");
                        failures += 1;
                    }
                }
            }
        }

        if self.unlinked_enabled() {
            failures += self.change_categories(&downloads).await;
        }

        if failures == 0 {
            info!(target: "download_cleaner", run_id = %ctx.run_id, "download cleaner finished");
            Ok(JobResult::Success)
        } else {
            Ok(JobResult::Failure {
                error: format!("download cleaning failed for {failures} client operation(s)"),
                retry: false,
            })
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::NONE
    }
}
