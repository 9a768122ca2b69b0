//! Table source: a queue whose storage is rows in the user's own table.
//!
//! The lock column carries all queue state (see [`lock`]); this module
//! translates queue operations into the dialect's SQL and marshals key and
//! private values through the user's schema adapter. No background owner
//! process does bookkeeping: crashed workers are recovered by the periodic
//! stale sweep, and concurrent nodes cooperate purely through the
//! database's row semantics.

pub mod lock;
pub mod sql;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::{epoch_ms, Job, QueueName, RowId, Task};
use crate::error::{CancelError, ConfigError, SourceError};
use crate::observability::QueueStatus;
use crate::ports::{Database, Repo, SchemaAdapter, SqlValue};
use crate::source::{FilterSelector, PollSource};

use lock::{classify, LockState};
use sql::{CockroachDb, Dialect, Postgres};

const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_RESET_STALE_INTERVAL: Duration = Duration::from_secs(300);

/// Everything a dialect needs to know about the backing table.
pub struct TableMeta {
    pub table: String,
    pub schema_prefix: Option<String>,
    pub primary_key: Vec<String>,
    pub lock_field: String,
    pub private_field: String,
    /// Extra predicate folded into the reserve statement's WHERE clause.
    pub run_if: Option<String>,
}

/// Produces a job's task from the reserved row's key. The default is a
/// `run` task whose arguments are the key values in order.
pub type TaskFn = Arc<dyn Fn(&RowId, &QueueName) -> Task + Send + Sync>;

/// Poll source backed by the user's table.
pub struct TableSource {
    queue: QueueName,
    repo: Arc<dyn Repo>,
    schema: Arc<dyn SchemaAdapter>,
    dialect: Arc<dyn Dialect>,
    meta: TableMeta,
    task_fn: Option<TaskFn>,
    stale_timeout: Duration,
    reset_stale_interval: Duration,
}

impl TableSource {
    pub fn builder(queue: QueueName) -> TableSourceBuilder {
        TableSourceBuilder::new(queue)
    }

    fn job_from_key_row(&self, row: Vec<SqlValue>) -> Result<(Job, Option<SqlValue>), SourceError> {
        let pk_fields = &self.meta.primary_key;
        let mut values = row;
        let private = if values.len() == pk_fields.len() + 1 {
            values.pop()
        } else if values.len() == pk_fields.len() {
            None
        } else {
            return Err(SourceError::Integrity(format!(
                "row has {} columns, expected the {} key fields",
                values.len(),
                pk_fields.len(),
            )));
        };

        let mut id = RowId::with_capacity(pk_fields.len());
        for (field, value) in pk_fields.iter().zip(values) {
            id.push((field.clone(), self.schema.load(field, value)?));
        }

        let task = match &self.task_fn {
            Some(task_fn) => task_fn(&id, &self.queue),
            None => default_task(&id),
        };

        let mut job = Job::new(self.queue.clone(), task);
        job.private = Some(id);
        Ok((job, private))
    }

    fn dump_key(&self, id: &RowId) -> Result<Vec<SqlValue>, SourceError> {
        self.meta
            .primary_key
            .iter()
            .map(|field| {
                let (_, value) = id
                    .iter()
                    .find(|(name, _)| name == field)
                    .ok_or_else(|| {
                        SourceError::Integrity(format!("row handle missing key field {field}"))
                    })?;
                self.schema.dump(field, value)
            })
            .collect()
    }

    fn key_of(job: &Job) -> Result<&RowId, SourceError> {
        job.row_id()
            .ok_or_else(|| SourceError::Integrity("job carries no row handle".into()))
    }
}

fn default_task(id: &RowId) -> Task {
    let args = id.iter().map(|(_, value)| value.clone()).collect();
    Task::new("run", serde_json::Value::Array(args))
}

fn decode_private(
    field: &str,
    value: Option<SqlValue>,
) -> Result<Option<serde_json::Value>, SourceError> {
    match value {
        None | Some(SqlValue::Null) => Ok(None),
        Some(SqlValue::Bytes(bytes)) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SourceError::Marshal {
                field: field.to_owned(),
                reason: e.to_string(),
            }),
        Some(other) => Err(SourceError::Marshal {
            field: field.to_owned(),
            reason: format!("expected a binary column, got {other:?}"),
        }),
    }
}

fn count_column(status: &str, value: Option<&SqlValue>) -> Result<u64, SourceError> {
    match value {
        Some(SqlValue::BigInt(v)) if *v >= 0 => Ok(*v as u64),
        other => Err(SourceError::Integrity(format!(
            "status column {status} was {other:?}, expected a count"
        ))),
    }
}

#[async_trait]
impl PollSource for TableSource {
    async fn reserve(&self) -> Result<Option<Job>, SourceError> {
        let sql = self.dialect.reserve_sql(&self.meta);
        let params = vec![SqlValue::BigInt(self.stale_timeout.as_millis() as i64)];
        let rows = match self.repo.fetch_all(&sql, params).await {
            Ok(rows) => rows,
            Err(e) if e.is_transient() => {
                warn!(queue = %self.queue, error = %e, "reserve failed, treating as empty");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let (mut job, private) = self.job_from_key_row(row)?;
        job.failure_private = decode_private(&self.meta.private_field, private)?;
        debug!(queue = %self.queue, task = %job.task, "reserved job");
        Ok(Some(job))
    }

    async fn ack(&self, job: &Job) -> Result<(), SourceError> {
        let id = Self::key_of(job)?;
        let sql = if job.completed_at.is_some() {
            self.dialect.finish_sql(&self.meta)
        } else {
            self.dialect.abandon_sql(&self.meta)
        };
        match self.repo.execute(&sql, self.dump_key(id)?).await {
            Ok(affected) => {
                if affected == 0 {
                    debug!(queue = %self.queue, "ack matched no row; already finalized");
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                // The row stays in the in-progress range and the stale
                // sweep will restore it; at-least-once allows the rerun.
                warn!(queue = %self.queue, error = %e, "ack failed, leaving row to the stale sweep");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn nack(&self, job: &Job, delay: Duration) -> Result<(), SourceError> {
        let id = Self::key_of(job)?;
        let blob = match &job.failure_private {
            Some(value) => SqlValue::Bytes(serde_json::to_vec(value).map_err(|e| {
                SourceError::Marshal {
                    field: self.meta.private_field.clone(),
                    reason: e.to_string(),
                }
            })?),
            None => SqlValue::Null,
        };
        let mut params = vec![SqlValue::BigInt(delay.as_secs() as i64), blob];
        params.extend(self.dump_key(id)?);

        let sql = self.dialect.delay_ready_sql(&self.meta);
        match self.repo.execute(&sql, params).await {
            Ok(1) => Ok(()),
            Ok(affected) => Err(SourceError::Integrity(format!(
                "nack affected {affected} rows, expected exactly 1"
            ))),
            Err(e) if e.is_transient() => {
                warn!(queue = %self.queue, error = %e, "nack failed, leaving row to the stale sweep");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cancel(&self, id: &RowId) -> Result<(), CancelError> {
        let sql = self.dialect.cancel_sql(&self.meta);
        let params = self.dump_key(id)?;
        let rows = self
            .repo
            .fetch_all(&sql, params)
            .await
            .map_err(SourceError::from)?;

        let Some(row) = rows.into_iter().next() else {
            return Err(CancelError::NotFound);
        };
        let previous = match row.first() {
            Some(SqlValue::BigInt(v)) => Some(*v),
            Some(SqlValue::Null) | None => None,
            Some(other) => {
                return Err(SourceError::Integrity(format!(
                    "cancel returned {other:?}, expected the previous lock value"
                ))
                .into())
            }
        };
        match classify(previous, epoch_ms()) {
            LockState::Ready | LockState::Delayed | LockState::Stale => Ok(()),
            LockState::InProgress => Err(CancelError::InProgress),
            LockState::Finished | LockState::Abandoned => Err(CancelError::NotFound),
        }
    }

    async fn status(&self) -> Result<QueueStatus, SourceError> {
        let sql = self.dialect.status_sql(&self.meta);
        let rows = self.repo.fetch_all(&sql, Vec::new()).await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::Integrity("status query returned no rows".into()))?;
        Ok(QueueStatus {
            total: count_column("total", row.first())?,
            abandoned: count_column("abandoned", row.get(1))?,
            ready: count_column("ready", row.get(2))?,
            delayed: count_column("delayed", row.get(3))?,
            stale: count_column("stale", row.get(4))?,
            in_progress: count_column("in_progress", row.get(5))?,
        })
    }

    async fn filter(&self, selector: FilterSelector) -> Result<Vec<Job>, SourceError> {
        let sql = self.dialect.filter_sql(&self.meta, selector);
        let rows = self.repo.fetch_all(&sql, Vec::new()).await?;
        rows.into_iter()
            .map(|row| self.job_from_key_row(row).map(|(job, _)| job))
            .collect()
    }

    async fn reset_stale(&self) -> Result<(), SourceError> {
        let sql = self.dialect.reset_stale_sql(&self.meta);
        match self.repo.execute(&sql, Vec::new()).await {
            Ok(restored) => {
                if restored > 0 {
                    debug!(queue = %self.queue, restored, "restored stale jobs");
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!(queue = %self.queue, error = %e, "stale sweep failed, will retry next interval");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn reset_stale_interval(&self) -> Option<Duration> {
        Some(self.reset_stale_interval)
    }
}

/// Builds a [`TableSource`], validating the configuration up front.
pub struct TableSourceBuilder {
    queue: QueueName,
    repo: Option<Arc<dyn Repo>>,
    schema: Option<Arc<dyn SchemaAdapter>>,
    database: Option<Database>,
    task_fn: Option<TaskFn>,
    run_if: Option<String>,
    stale_timeout: Duration,
    reset_stale_interval: Duration,
}

impl TableSourceBuilder {
    pub fn new(queue: QueueName) -> Self {
        Self {
            queue,
            repo: None,
            schema: None,
            database: None,
            task_fn: None,
            run_if: None,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            reset_stale_interval: DEFAULT_RESET_STALE_INTERVAL,
        }
    }

    pub fn repo(mut self, repo: Arc<dyn Repo>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn schema(mut self, schema: Arc<dyn SchemaAdapter>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Override the dialect; by default it is inferred from the repo.
    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn task_fn(mut self, task_fn: TaskFn) -> Self {
        self.task_fn = Some(task_fn);
        self
    }

    /// Predicate restricting which ready rows are reservable.
    pub fn run_if(mut self, predicate: impl Into<String>) -> Self {
        self.run_if = Some(predicate.into());
        self
    }

    /// Longest a job is expected to run; a reservation older than this is
    /// considered stale.
    pub fn stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    pub fn reset_stale_interval(mut self, interval: Duration) -> Self {
        self.reset_stale_interval = interval;
        self
    }

    pub fn build(self) -> Result<TableSource, ConfigError> {
        let repo = self.repo.ok_or(ConfigError::Missing("repo"))?;
        let schema = self.schema.ok_or(ConfigError::Missing("schema"))?;
        if self.stale_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                option: "stale_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        if schema.primary_key().is_empty() {
            return Err(ConfigError::Invalid {
                option: "schema",
                reason: "table has no primary-key fields".into(),
            });
        }

        let token = self.queue.column_token();
        let meta = TableMeta {
            table: schema.table().to_owned(),
            schema_prefix: schema.schema_prefix().map(str::to_owned),
            primary_key: schema.primary_key().to_vec(),
            lock_field: format!("honeydew_{token}_lock"),
            private_field: format!("honeydew_{token}_private"),
            run_if: self.run_if,
        };
        let dialect: Arc<dyn Dialect> = match self.database.unwrap_or_else(|| repo.database()) {
            Database::Postgres => Arc::new(Postgres),
            Database::CockroachDb => Arc::new(CockroachDb),
        };

        Ok(TableSource {
            queue: self.queue,
            repo,
            schema,
            dialect,
            meta,
            task_fn: self.task_fn,
            stale_timeout: self.stale_timeout,
            reset_stale_interval: self.reset_stale_interval,
        })
    }
}
