//! Queue processes: configuration, spawning, and the external surface.

pub(crate) mod poll;
pub mod registry;

pub use poll::QueueControl;
pub use registry::Registry;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::domain::{Job, QueueName, Receipt, RowId, Task};
use crate::error::{CancelError, ConfigError, QueueError};
use crate::failure::{Abandon, FailureMode, SuccessMode};
use crate::handlers::Handlers;
use crate::observability::QueueStatus;
use crate::source::{FilterSelector, PollSource};
use crate::worker::{ExecutionContext, WorkerPool};

use poll::{PollLoop, QueueEvent};

const EVENT_BUFFER: usize = 64;

/// Worker-selection strategy.
///
/// The free-worker list is kept in least-recently-used order, which is the
/// only strategy currently shipped; a node-aware variant belongs to the
/// cluster registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dispatcher {
    #[default]
    LeastRecentlyUsed,
}

/// Per-queue configuration.
#[derive(Clone)]
pub struct QueueOptions {
    pub workers: usize,
    /// Idle poll cadence; polling resumes immediately on acks and fresh
    /// enqueues.
    pub poll_interval: Duration,
    pub failure_mode: Arc<dyn FailureMode>,
    pub success_mode: Option<Arc<dyn SuccessMode>>,
    pub dispatcher: Dispatcher,
    /// Start the queue without polling; [`QueueHandle::resume`] reverses.
    pub suspended: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            workers: 10,
            poll_interval: Duration::from_secs(10),
            failure_mode: Arc::new(Abandon),
            success_mode: None,
            dispatcher: Dispatcher::default(),
            suspended: false,
        }
    }
}

/// Cloneable address of a running queue process.
#[derive(Clone)]
pub struct QueueHandle {
    pub(crate) name: QueueName,
    pub(crate) tx: mpsc::Sender<QueueEvent>,
}

/// Start a queue process and its worker pool, registering the handle.
///
/// Fails fast on configuration problems: a zero-sized pool, a zero poll
/// interval, a failure mode that rejects its arguments, or a name that is
/// already registered.
pub fn spawn(
    name: QueueName,
    source: Arc<dyn PollSource>,
    handlers: Arc<Handlers>,
    registry: Arc<Registry>,
    options: QueueOptions,
) -> Result<QueueHandle, QueueError> {
    options.failure_mode.validate()?;
    if options.workers == 0 {
        return Err(ConfigError::Invalid {
            option: "workers",
            reason: "must be greater than 0".into(),
        }
        .into());
    }
    if options.poll_interval.is_zero() {
        return Err(ConfigError::Invalid {
            option: "poll_interval",
            reason: "must be greater than 0".into(),
        }
        .into());
    }

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let handle = QueueHandle {
        name: name.clone(),
        tx: tx.clone(),
    };
    registry.register(handle.clone())?;

    let ctx = Arc::new(ExecutionContext {
        queue: QueueControl { tx: tx.clone() },
        registry: Arc::clone(&registry),
        failure_mode: Arc::clone(&options.failure_mode),
        success_mode: options.success_mode.clone(),
    });
    let pool = WorkerPool::spawn(options.workers, handlers, tx, ctx);

    let poll_loop = PollLoop {
        name,
        source,
        registry,
        poll_interval: options.poll_interval,
        suspended: options.suspended,
        outstanding: 0,
        free_workers: VecDeque::new(),
        buffered: VecDeque::new(),
        poll_at: None,
        workers: Some(pool),
    };
    tokio::spawn(poll_loop.run(rx));

    Ok(handle)
}

impl QueueHandle {
    pub fn name(&self) -> &QueueName {
        &self.name
    }

    /// Enqueue a prepared job on this queue's backend.
    pub async fn enqueue(&self, job: Job) -> Result<Job, QueueError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(QueueEvent::Enqueue(job, reply))
            .await
            .map_err(|_| QueueError::Closed)?;
        response.await.map_err(|_| QueueError::Closed)?
    }

    /// Fire-and-forget a task.
    pub async fn dispatch(&self, task: Task) -> Result<Job, QueueError> {
        self.enqueue(Job::new(self.name.clone(), task)).await
    }

    /// Run a task, keeping a receipt the caller can wait on for the result.
    pub async fn dispatch_with_reply(&self, task: Task) -> Result<(Job, Receipt), QueueError> {
        let (job, receipt) = Job::new(self.name.clone(), task).with_reply();
        let job = self.enqueue(job).await?;
        Ok((job, receipt))
    }

    /// Stop handing out jobs; buffered and stored jobs stay put.
    pub async fn suspend(&self) -> Result<(), QueueError> {
        self.tx
            .send(QueueEvent::Suspend)
            .await
            .map_err(|_| QueueError::Closed)
    }

    pub async fn resume(&self) -> Result<(), QueueError> {
        self.tx
            .send(QueueEvent::Resume)
            .await
            .map_err(|_| QueueError::Closed)
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(QueueEvent::Status(reply))
            .await
            .map_err(|_| QueueError::Closed)?;
        response.await.map_err(|_| QueueError::Closed)?
    }

    pub async fn filter(&self, selector: FilterSelector) -> Result<Vec<Job>, QueueError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(QueueEvent::Filter(selector, reply))
            .await
            .map_err(|_| QueueError::Closed)?;
        response.await.map_err(|_| QueueError::Closed)?
    }

    /// Cancel a job by row handle. Returns immediately; an in-progress job
    /// is refused rather than interrupted.
    pub async fn cancel(&self, id: &RowId) -> Result<(), CancelError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(QueueEvent::Cancel(id.clone(), reply))
            .await
            .map_err(|_| CancelError::Closed)?;
        response.await.map_err(|_| CancelError::Closed)?
    }

    /// Finalize `job` here as abandoned and enqueue a cleared copy on
    /// `target`, whatever backend that queue uses.
    pub async fn move_to(&self, job: Job, target: QueueName) -> Result<(), QueueError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(QueueEvent::Move(job, target, reply))
            .await
            .map_err(|_| QueueError::Closed)?;
        response.await.map_err(|_| QueueError::Closed)?
    }

    /// Stop the queue process and its workers. In-flight jobs finish; their
    /// acks after shutdown are lost and the stale sweep of a restarted
    /// queue picks the rows back up.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(QueueEvent::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobResult;
    use crate::failure::{Move, Retry, RetryPolicy};
    use crate::handlers::TaskHandler;
    use crate::source::MemorySource;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingHandler {
        seen: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn handle(&self, args: &serde_json::Value) -> Result<serde_json::Value, String> {
            self.seen.lock().unwrap().push(args.clone());
            Ok(json!("done"))
        }
    }

    struct FailingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn handle(&self, _args: &serde_json::Value) -> Result<serde_json::Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("always fails".to_owned())
        }
    }

    fn handlers_with(name: &str, handler: Arc<dyn TaskHandler>) -> Arc<Handlers> {
        Arc::new(Handlers::new().with(name, handler).unwrap())
    }

    async fn drained(handle: &QueueHandle) {
        for _ in 0..400 {
            let status = handle.status().await.unwrap();
            if status.total == status.abandoned {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("queue did not drain: {:?}", handle.status().await);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueued_jobs_drain_through_the_workers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = spawn(
            QueueName::local("photos"),
            Arc::new(MemorySource::new()),
            handlers_with("run", Arc::new(RecordingHandler { seen: Arc::clone(&seen) })),
            Arc::new(Registry::new()),
            QueueOptions {
                workers: 5,
                poll_interval: Duration::from_millis(100),
                ..QueueOptions::default()
            },
        )
        .unwrap();

        for n in 1..=3 {
            handle.dispatch(Task::new("run", json!([n]))).await.unwrap();
        }
        drained(&handle).await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_by_key(|v| v[0].as_u64());
        assert_eq!(seen, vec![json!([1]), json!([2]), json!([3])]);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_blocks_processing_until_resume() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = spawn(
            QueueName::local("photos"),
            Arc::new(MemorySource::new()),
            handlers_with("run", Arc::new(RecordingHandler { seen: Arc::clone(&seen) })),
            Arc::new(Registry::new()),
            QueueOptions {
                workers: 2,
                poll_interval: Duration::from_millis(100),
                suspended: true,
                ..QueueOptions::default()
            },
        )
        .unwrap();

        handle.dispatch(Task::new("run", json!([1]))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.ready, 1);
        assert!(seen.lock().unwrap().is_empty());

        handle.resume().await.unwrap();
        drained(&handle).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retry_then_abandon_makes_every_configured_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = spawn(
            QueueName::local("photos"),
            Arc::new(MemorySource::new()),
            handlers_with("run", Arc::new(FailingHandler { calls: Arc::clone(&calls) })),
            Arc::new(Registry::new()),
            QueueOptions {
                workers: 1,
                poll_interval: Duration::from_millis(100),
                failure_mode: Arc::new(Retry::with_policy(
                    2,
                    RetryPolicy {
                        base_delay: Duration::from_secs(1),
                        multiplier: 1.0,
                    },
                )),
                ..QueueOptions::default()
            },
        )
        .unwrap();

        let (_job, mut receipt) = handle
            .dispatch_with_reply(Task::new("run", json!([1])))
            .await
            .unwrap();

        let result = receipt.recv(Duration::from_secs(600)).await;
        assert_eq!(result, Some(JobResult::Exit("always fails".to_owned())));
        // Initial attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let status = handle.status().await.unwrap();
        assert_eq!(status.abandoned, 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn moved_jobs_land_on_the_target_queue() {
        let registry = Arc::new(Registry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        // Target queue held suspended so the moved job stays visible.
        let dlq = spawn(
            QueueName::local("dlq"),
            Arc::new(MemorySource::new()),
            handlers_with("run", Arc::new(RecordingHandler { seen: Arc::new(Mutex::new(Vec::new())) })),
            Arc::clone(&registry),
            QueueOptions {
                workers: 1,
                suspended: true,
                ..QueueOptions::default()
            },
        )
        .unwrap();

        let handle = spawn(
            QueueName::local("photos"),
            Arc::new(MemorySource::new()),
            handlers_with("run", Arc::new(FailingHandler { calls: Arc::clone(&calls) })),
            Arc::clone(&registry),
            QueueOptions {
                workers: 1,
                poll_interval: Duration::from_millis(100),
                failure_mode: Arc::new(Move::to(QueueName::local("dlq"))),
                ..QueueOptions::default()
            },
        )
        .unwrap();

        let (_job, mut receipt) = handle
            .dispatch_with_reply(Task::new("run", json!([1])))
            .await
            .unwrap();

        let result = receipt.recv(Duration::from_secs(60)).await;
        assert_eq!(result, Some(JobResult::Moved("always fails".to_owned())));

        let source_status = handle.status().await.unwrap();
        assert_eq!(source_status.abandoned, 1);

        let dlq_status = dlq.status().await.unwrap();
        assert_eq!(dlq_status.ready, 1);

        handle.shutdown().await;
        dlq.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_through_the_handle() {
        let handle = spawn(
            QueueName::local("photos"),
            Arc::new(MemorySource::new()),
            handlers_with("run", Arc::new(RecordingHandler { seen: Arc::new(Mutex::new(Vec::new())) })),
            Arc::new(Registry::new()),
            QueueOptions {
                workers: 1,
                suspended: true,
                ..QueueOptions::default()
            },
        )
        .unwrap();

        let job = handle.dispatch(Task::new("run", json!([1]))).await.unwrap();
        let id = job.row_id().unwrap().clone();

        handle.cancel(&id).await.unwrap();
        assert!(matches!(
            handle.cancel(&id).await,
            Err(CancelError::NotFound)
        ));
        assert_eq!(handle.status().await.unwrap().total, 0);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_the_handle() {
        let handle = spawn(
            QueueName::local("photos"),
            Arc::new(MemorySource::new()),
            handlers_with("run", Arc::new(RecordingHandler { seen: Arc::new(Mutex::new(Vec::new())) })),
            Arc::new(Registry::new()),
            QueueOptions::default(),
        )
        .unwrap();

        handle.shutdown().await;
        // Give the loop a tick to wind down.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(handle.status().await, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn spawn_rejects_bad_configuration() {
        let registry = Arc::new(Registry::new());
        let handlers = handlers_with("run", Arc::new(RecordingHandler { seen: Arc::new(Mutex::new(Vec::new())) }));

        let zero_workers = spawn(
            QueueName::local("photos"),
            Arc::new(MemorySource::new()),
            Arc::clone(&handlers),
            Arc::clone(&registry),
            QueueOptions {
                workers: 0,
                ..QueueOptions::default()
            },
        );
        assert!(matches!(zero_workers, Err(QueueError::Config(_))));

        let bad_retry = spawn(
            QueueName::local("photos"),
            Arc::new(MemorySource::new()),
            Arc::clone(&handlers),
            Arc::clone(&registry),
            QueueOptions {
                failure_mode: Arc::new(Retry::times(0)),
                ..QueueOptions::default()
            },
        );
        assert!(matches!(bad_retry, Err(QueueError::Config(_))));

        spawn(
            QueueName::local("photos"),
            Arc::new(MemorySource::new()),
            Arc::clone(&handlers),
            Arc::clone(&registry),
            QueueOptions::default(),
        )
        .unwrap();
        let duplicate = spawn(
            QueueName::local("photos"),
            Arc::new(MemorySource::new()),
            handlers,
            registry,
            QueueOptions::default(),
        );
        assert!(matches!(duplicate, Err(QueueError::AlreadyRegistered(_))));
    }
}
