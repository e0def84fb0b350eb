// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Execution context handed to a job for one run
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    /// Distinguishes one invocation from the next in logs.
    pub run_id: Uuid,
    pub execution_time: DateTime<Utc>,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            run_id: Uuid::new_v4(),
            execution_time: Utc::now(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// The job had nothing to do, usually because it is disabled.
    Skipped { reason: String },
    Failure { error: String, retry: bool },
}

/// How often a failed run is attempted again before waiting for the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const NONE: Self = Self {
        max_retries: 0,
        delay: Duration::ZERO,
    };

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(60),
        }
    }
}

#[async_trait::async_trait]
pub trait Job: Send + Sync {
    /// Stable identifier for this kind of job
    fn job_type(&self) -> &'static str;

    fn name(&self) -> String;

    async fn execute(&self, ctx: JobContext) -> Result<JobResult>;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

impl fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("type", &self.job_type())
            .field("name", &self.name())
            .finish()
    }
}
