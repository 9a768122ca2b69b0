//! honeydew-core
//!
//! Pluggable background jobs whose queue can live wherever you point it -
//! including as plain rows in your own database tables, where a single
//! integer lock column encodes membership, ordering, visibility timeouts
//! and terminal disposition, and concurrent worker nodes cooperate purely
//! through the database's row semantics.
//!
//! Module map:
//! - domain: queue names, tasks, jobs, reply channels
//! - ports: capability interfaces the caller injects (repo, schema)
//! - source: the PollSource seam, the table source + SQL dialects, and an
//!   in-memory source
//! - queue: the poll-driven queue loop, configuration, registry
//! - handlers: the named callables a worker pool dispatches to
//! - worker: worker pool and execution monitor
//! - failure: abandon/retry/move strategies
//! - impls: shipped port implementations (sqlx Postgres repo)
//! - observability: status counts
//! - error: crate-level error types

pub mod domain;
pub mod error;
pub mod failure;
pub mod handlers;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod source;
pub mod worker;

pub use domain::{Job, JobResult, QueueName, Receipt, RowId, Task};
pub use error::{CancelError, ConfigError, QueueError, SourceError};
pub use handlers::{Handlers, TaskHandler};
pub use observability::QueueStatus;
pub use queue::{spawn, Dispatcher, QueueHandle, QueueOptions, Registry};
pub use source::{FilterSelector, MemorySource, PollSource, TableSource};
