//! Crate error taxonomy, one enum per domain.

use thiserror::Error;

use crate::domain::QueueName;

/// Rejected at queue or source construction; startup fails fast.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required option: {0}")]
    Missing(&'static str),

    #[error("invalid option {option}: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },

    #[error("duplicate handler for task {0}")]
    DuplicateHandler(String),
}

/// How a storage failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoErrorKind {
    /// Connection loss, pool exhaustion, deadlock; worth retrying later.
    Transient,
    /// Bad schema, missing column, decode failure; retrying won't help.
    Logical,
}

/// Failure reported by a [`Repo`](crate::ports::Repo) implementation.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RepoError {
    pub kind: RepoErrorKind,
    pub message: String,
}

impl RepoError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: RepoErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn logical(message: impl Into<String>) -> Self {
        Self {
            kind: RepoErrorKind::Logical,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RepoErrorKind::Transient
    }
}

/// Failure inside a poll source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Storage(#[from] RepoError),

    #[error("marshaling failed for {field}: {reason}")]
    Marshal { field: String, reason: String },

    /// An update affected a different number of rows than the lock
    /// discipline allows. Propagates; the queue process does not continue
    /// past it.
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("{0} is not supported by this source")]
    Unsupported(&'static str),
}

/// Outcome of a cancel that did not cancel.
#[derive(Debug, Error)]
pub enum CancelError {
    #[error("job is in progress")]
    InProgress,

    #[error("no such job")]
    NotFound,

    #[error("queue is shut down")]
    Closed,

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Failure at the queue surface.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no queue registered under {0}")]
    NoSuchQueue(QueueName),

    #[error("queue {0} is already registered")]
    AlreadyRegistered(QueueName),

    #[error("queue is shut down")]
    Closed,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),
}
