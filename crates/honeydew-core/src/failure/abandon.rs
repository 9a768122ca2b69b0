//! Abandon: give up on the job.

use async_trait::async_trait;

use crate::domain::{Job, JobResult};

use super::{FailureContext, FailureMode};

/// Terminal failure: finalize the row as abandoned and tell the caller.
///
/// The ack goes out with `completed_at` absent, which is the source's
/// signal to write the abandoned marker rather than finish the row.
pub struct Abandon;

#[async_trait]
impl FailureMode for Abandon {
    async fn handle_failure(&self, mut job: Job, reason: String, ctx: &FailureContext) {
        tracing::debug!(queue = %job.queue, task = %job.task, %reason, "abandoning job");
        job.completed_at = None;
        job.result = Some(JobResult::Exit(reason));
        job.send_reply();
        ctx.queue.ack(job).await;
    }
}
