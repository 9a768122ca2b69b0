//! Retry with backoff, then abandon.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::domain::Job;
use crate::error::ConfigError;

use super::{Abandon, FailureContext, FailureMode};

/// Retry policy: decides backoff delays.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for subsequent retries.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-indexed):
    /// `base_delay * multiplier^(attempt - 1)`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs)
    }
}

/// Retry a failing job up to `times` before handing it to [`Abandon`].
///
/// The attempt counter rides in the job's `failure_private` blob, so it
/// survives worker crashes and queue restarts along with the row.
pub struct Retry {
    times: u32,
    policy: RetryPolicy,
}

impl Retry {
    pub fn times(times: u32) -> Self {
        Self {
            times,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(times: u32, policy: RetryPolicy) -> Self {
        Self { times, policy }
    }

    fn attempts_so_far(job: &Job) -> u32 {
        job.failure_private
            .as_ref()
            .and_then(|private| private.get("attempts"))
            .and_then(|attempts| attempts.as_u64())
            .unwrap_or(0) as u32
    }
}

#[async_trait]
impl FailureMode for Retry {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.times == 0 {
            return Err(ConfigError::Invalid {
                option: "failure_mode",
                reason: "retry count must be at least 1".into(),
            });
        }
        Ok(())
    }

    async fn handle_failure(&self, mut job: Job, reason: String, ctx: &FailureContext) {
        let made = Self::attempts_so_far(&job);
        if made < self.times {
            let attempt = made + 1;
            job.failure_private = Some(json!({ "attempts": attempt }));
            let delay = self.policy.next_delay(attempt);
            tracing::debug!(queue = %job.queue, attempt, ?delay, %reason, "retrying job");
            ctx.queue.nack(job, delay).await;
        } else {
            Abandon.handle_failure(job, reason, ctx).await;
        }
    }
}
