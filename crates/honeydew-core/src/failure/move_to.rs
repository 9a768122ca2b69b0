//! Move: reroute failures to another queue.

use async_trait::async_trait;
use tracing::warn;

use crate::domain::{Job, JobResult, QueueName};
use crate::error::ConfigError;

use super::{FailureContext, FailureMode};

/// Abandon the failed job here and enqueue a cleared copy elsewhere,
/// typically a dead-letter queue on whatever backend that queue uses.
pub struct Move {
    to: QueueName,
}

impl Move {
    pub fn to(queue: QueueName) -> Self {
        Self { to: queue }
    }
}

#[async_trait]
impl FailureMode for Move {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.to.as_str().is_empty() {
            return Err(ConfigError::Invalid {
                option: "failure_mode",
                reason: "target queue name is empty".into(),
            });
        }
        Ok(())
    }

    async fn handle_failure(&self, mut job: Job, reason: String, ctx: &FailureContext) {
        // Finalize the original first so a redelivered monitor cannot run
        // it here again.
        let mut original = job.clone();
        original.completed_at = None;
        original.result = None;
        ctx.queue.ack(original).await;

        let mut copy = job.clone();
        copy.queue = self.to.clone();
        copy.private = None;
        copy.failure_private = None;
        copy.result = None;
        copy.completed_at = None;
        match ctx.registry.lookup(&self.to) {
            Some(target) => {
                if let Err(e) = target.enqueue(copy).await {
                    warn!(queue = %self.to, error = %e, "failed to move job");
                }
            }
            None => warn!(queue = %self.to, "no queue registered to move the job to"),
        }

        job.result = Some(JobResult::Moved(reason));
        job.send_reply();
    }
}
