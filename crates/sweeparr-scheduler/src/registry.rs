// SPDX-License-Identifier: GPL-3.0-or-later
use crate::job::{Job, JobContext, JobResult};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Job schedule configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Run immediately, then at fixed intervals (in seconds)
    Interval(u64),
    /// Run once immediately, then never again
    Once,
}

struct RegisteredJob {
    job: Arc<dyn Job>,
    schedule: Schedule,
    // Held for the duration of a run so ticks never overlap a slow run.
    running: Arc<Mutex<()>>,
}

/// Job registry that manages and executes scheduled jobs
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, RegisteredJob>>>,
    max_concurrent: usize,
}

impl JobRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Register a job with its schedule
    pub async fn register(
        &self,
        job_id: impl Into<String>,
        job: impl Job + 'static,
        schedule: Schedule,
    ) -> Result<()> {
        let job_id = job_id.into();
        if schedule == Schedule::Interval(0) {
            bail!("job '{job_id}' has a zero interval");
        }

        let registered = RegisteredJob {
            job: Arc::new(job) as Arc<dyn Job>,
            schedule,
            running: Arc::new(Mutex::new(())),
        };

        let mut jobs = self.jobs.write().await;
        info!(target: "registry", %job_id, job_type = registered.job.job_type(), schedule = ?registered.schedule, "registering job");
        jobs.insert(job_id, registered);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Start the job registry executor
    pub async fn start(self: Arc<Self>) {
        info!(target: "registry", max_concurrent = self.max_concurrent, "starting job registry");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let jobs = self.jobs.read().await;

        for (job_id, registered) in jobs.iter() {
            let job_id = job_id.clone();
            let job = registered.job.clone();
            let running = registered.running.clone();
            let semaphore = semaphore.clone();

            match registered.schedule {
                Schedule::Interval(seconds) => {
                    tokio::spawn(async move {
                        let mut ticker = interval(Duration::from_secs(seconds));
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        loop {
                            ticker.tick().await;
                            let Ok(guard) = running.clone().try_lock_owned() else {
                                debug!(target: "registry", %job_id, "previous run still active, skipping tick");
                                continue;
                            };
                            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                                break;
                            };
                            let job = job.clone();
                            let job_id = job_id.clone();
                            tokio::spawn(async move {
                                let _guard = guard;
                                let _permit = permit;
                                Self::execute_job(&job_id, job.as_ref()).await;
                            });
                        }
                    });
                }
                Schedule::Once => {
                    tokio::spawn(async move {
                        let _guard = running.lock().await;
                        if let Ok(_permit) = semaphore.acquire_owned().await {
                            Self::execute_job(&job_id, job.as_ref()).await;
                        }
                    });
                }
            }
        }

        info!(target: "registry", "job registry started with {} jobs", jobs.len());
    }

    /// Run a job to completion, retrying per its policy. Returns the last result.
    pub async fn execute_job(job_id: &str, job: &dyn Job) -> JobResult {
        let policy = job.retry_policy();
        let max_attempts = policy.max_attempts();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let ctx = JobContext::new(job_id);
            info!(
                target: "registry",
                job_id,
                run_id = %ctx.run_id,
                job_type = job.job_type(),
                attempt = attempts,
                max_attempts,
                "executing job"
            );

            let (error, retry) = match job.execute(ctx).await {
                Ok(JobResult::Success) => {
                    info!(target: "registry", job_id, job_type = job.job_type(), attempts, "job completed successfully");
                    return JobResult::Success;
                }
                Ok(JobResult::Skipped { reason }) => {
                    info!(target: "registry", job_id, job_type = job.job_type(), %reason, "job skipped");
                    return JobResult::Skipped { reason };
                }
                Ok(JobResult::Failure { error, retry }) => (error, retry),
                Err(err) => (format!("{err:#}"), true),
            };

            error!(
                target: "registry",
                job_id,
                job_type = job.job_type(),
                attempts,
                %error,
                retry,
                "job failed"
            );

            if !retry || attempts >= max_attempts {
                if retry {
                    error!(target: "registry", job_id, "job exhausted all retry attempts");
                }
                return JobResult::Failure { error, retry };
            }

            warn!(target: "registry", job_id, delay = ?policy.delay, "retrying job after delay");
            tokio::time::sleep(policy.delay).await;
        }
    }
}
