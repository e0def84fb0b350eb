// SPDX-License-Identifier: GPL-3.0-or-later
pub mod job;
pub mod jobs;
pub mod registry;

use anyhow::Result;
use registry::JobRegistry;
use std::sync::Arc;
use sweeparr_config::SchedulerConfig;
use tokio::task::JoinHandle;
use tracing::info;

use jobs::{DownloadCleanerJob, QueueCleanerJob};

pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let registry = Arc::new(JobRegistry::new(config.max_concurrent_jobs));
        Self { config, registry }
    }

    /// Register both cleaners with their configured intervals
    pub async fn register_jobs(
        &self,
        queue_cleaner: QueueCleanerJob,
        download_cleaner: DownloadCleanerJob,
    ) -> Result<()> {
        info!(target: "scheduler", "registering background jobs");

        self.registry
            .register(
                "queue-cleaner",
                queue_cleaner,
                Schedule::Interval(self.config.queue_cleaner_interval_secs),
            )
            .await?;

        self.registry
            .register(
                "download-cleaner",
                download_cleaner,
                Schedule::Interval(self.config.download_cleaner_interval_secs),
            )
            .await?;

        info!(target: "scheduler", "all jobs registered");
        Ok(())
    }

    /// Start the scheduler and return a handle to the background task
    pub fn start(self) -> JoinHandle<Result<()>> {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            registry.start().await;
            Ok(())
        })
    }
}

// Re-export key types for convenience
pub use job::{Job, JobContext, JobResult, RetryPolicy};
pub use registry::Schedule;
