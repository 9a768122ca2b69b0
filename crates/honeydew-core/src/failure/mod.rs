//! Failure and success modes: pluggable strategies for routed outcomes.

mod abandon;
mod move_to;
mod retry;

pub use abandon::Abandon;
pub use move_to::Move;
pub use retry::{Retry, RetryPolicy};

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::Job;
use crate::error::ConfigError;
use crate::queue::{QueueControl, Registry};

/// What a failure mode may reach: the owning queue's control channel and
/// the registry for rerouting.
pub struct FailureContext {
    pub queue: QueueControl,
    pub registry: Arc<Registry>,
}

/// Strategy invoked when a job's execution throws.
///
/// Monitors may be redelivered, so implementations stay safe under
/// repeated invocation for the same job.
#[async_trait]
pub trait FailureMode: Send + Sync {
    /// Construction-time validation; queues refuse to start on `Err`.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn handle_failure(&self, job: Job, reason: String, ctx: &FailureContext);
}

/// Strategy invoked after a job succeeds, before the ack.
#[async_trait]
pub trait SuccessMode: Send + Sync {
    async fn handle_success(&self, job: &Job);
}
