//! Poll sources: the storage seam behind every queue.
//!
//! A queue process drives whatever implements [`PollSource`]; the
//! table-backed source is the main one, the in-memory source exists for
//! tests and as a lightweight target for moved jobs.

mod memory;
pub mod table;

pub use memory::MemorySource;
pub use table::{TableSource, TableSourceBuilder};

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Job, RowId};
use crate::error::{CancelError, SourceError};
use crate::observability::QueueStatus;

/// Which jobs a filter selects. Abandoned rows are the only currently
/// addressable set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSelector {
    Abandoned,
}

/// Storage backend a poll-driven queue reserves from.
///
/// Design intent:
/// - The source owns all storage semantics; the queue loop only schedules.
/// - `reserve`/`ack`/`nack` are the worker-facing lifecycle; the rest is
///   administration.
#[async_trait]
pub trait PollSource: Send + Sync {
    /// Atomically claim one ready job. `Ok(None)` means nothing was
    /// eligible, including when storage was transiently unreachable.
    async fn reserve(&self) -> Result<Option<Job>, SourceError>;

    /// Finalize a reserved job. A job with `completed_at` set finishes; an
    /// ack without it abandons the row instead.
    async fn ack(&self, job: &Job) -> Result<(), SourceError>;

    /// Reschedule a reserved job `delay` into the future, persisting its
    /// `failure_private` blob alongside.
    async fn nack(&self, job: &Job, delay: Duration) -> Result<(), SourceError>;

    /// Remove a not-yet-running job from the queue.
    async fn cancel(&self, id: &RowId) -> Result<(), CancelError>;

    async fn status(&self) -> Result<QueueStatus, SourceError>;

    /// Placeholder jobs for every row the selector matches.
    async fn filter(&self, selector: FilterSelector) -> Result<Vec<Job>, SourceError>;

    /// Rescue jobs whose worker died mid-execution. Idempotent; sources
    /// without the concept keep the default no-op.
    async fn reset_stale(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// How often the queue should run [`reset_stale`](Self::reset_stale),
    /// if this source wants a sweep at all.
    fn reset_stale_interval(&self) -> Option<Duration> {
        None
    }

    /// Accept a new job. Table-backed sources refuse: their rows are
    /// inserted by the application, not through the queue.
    async fn enqueue(&self, job: Job) -> Result<Job, SourceError> {
        let _ = job;
        Err(SourceError::Unsupported("enqueue"))
    }
}
