//! The poll-driven queue loop.
//!
//! One single-owner event loop per queue: state is mutated only here, and
//! everything else talks to it through the event channel. Two timers run
//! alongside the mailbox - the idle poll timer and the stale-reset sweep -
//! and both die with the loop.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

use crate::domain::{Job, QueueName, RowId};
use crate::error::{CancelError, ConfigError, QueueError};
use crate::observability::QueueStatus;
use crate::source::{FilterSelector, PollSource};
use crate::worker::WorkerPool;

use super::registry::Registry;

/// Everything that can happen to a queue process.
pub(crate) enum QueueEvent {
    WorkerReady(WorkerHandle),
    Ack(Job),
    Nack(Job, Duration),
    Suspend,
    Resume,
    Status(oneshot::Sender<Result<QueueStatus, QueueError>>),
    Cancel(RowId, oneshot::Sender<Result<(), CancelError>>),
    Filter(
        FilterSelector,
        oneshot::Sender<Result<Vec<Job>, QueueError>>,
    ),
    Enqueue(Job, oneshot::Sender<Result<Job, QueueError>>),
    Move(Job, QueueName, oneshot::Sender<Result<(), QueueError>>),
    Shutdown,
}

/// Address of an idle worker waiting for its next job.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    pub id: usize,
    pub tx: mpsc::Sender<Job>,
}

/// Sender half used by workers and failure modes to route job outcomes
/// back into the queue process.
#[derive(Clone)]
pub struct QueueControl {
    pub(crate) tx: mpsc::Sender<QueueEvent>,
}

impl QueueControl {
    pub async fn ack(&self, job: Job) {
        let _ = self.tx.send(QueueEvent::Ack(job)).await;
    }

    pub async fn nack(&self, job: Job, delay: Duration) {
        let _ = self.tx.send(QueueEvent::Nack(job, delay)).await;
    }
}

pub(crate) struct PollLoop {
    pub name: QueueName,
    pub source: Arc<dyn PollSource>,
    pub registry: Arc<Registry>,
    pub poll_interval: Duration,
    pub suspended: bool,
    /// Reserved jobs not yet acked or nacked.
    pub outstanding: usize,
    /// Idle workers in least-recently-used order.
    pub free_workers: VecDeque<WorkerHandle>,
    /// Reserved jobs waiting for a worker.
    pub buffered: VecDeque<Job>,
    pub poll_at: Option<Instant>,
    /// Owned so the workers outlive exactly this loop.
    pub workers: Option<WorkerPool>,
}

impl PollLoop {
    pub async fn run(mut self, mut rx: mpsc::Receiver<QueueEvent>) {
        if !self.suspended {
            self.poll_at = Some(Instant::now());
        }
        let sweep_every = self.source.reset_stale_interval();
        let mut sweep_at = sweep_every.map(|interval| Instant::now() + interval);

        loop {
            let poll_deadline = self.poll_at;
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if self.handle_event(event).await.is_break() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = deadline(poll_deadline), if poll_deadline.is_some() => {
                    self.poll_at = None;
                    if self.poll().await.is_break() {
                        break;
                    }
                }
                _ = deadline(sweep_at), if sweep_at.is_some() => {
                    // Re-armed before the sweep runs, regardless of outcome.
                    sweep_at = sweep_every.map(|interval| Instant::now() + interval);
                    if let Err(e) = self.source.reset_stale().await {
                        error!(queue = %self.name, error = %e, "stale sweep failed");
                        break;
                    }
                }
            }
        }

        // Close the mailbox first so workers blocked on an advertisement
        // see the queue go away instead of waiting forever.
        drop(rx);
        if let Some(pool) = self.workers.take() {
            pool.shutdown_and_join().await;
        }
        debug!(queue = %self.name, "queue loop stopped");
    }

    async fn handle_event(&mut self, event: QueueEvent) -> ControlFlow<()> {
        match event {
            QueueEvent::WorkerReady(worker) => {
                if !self.suspended {
                    if let Some(job) = self.buffered.pop_front() {
                        self.dispatch(job, worker).await;
                        return ControlFlow::Continue(());
                    }
                }
                self.free_workers.push_back(worker);
                if !self.suspended && self.buffered.is_empty() {
                    self.poll_now();
                }
            }
            QueueEvent::Ack(job) => {
                self.outstanding = self.outstanding.saturating_sub(1);
                debug!(queue = %self.name, outstanding = self.outstanding, "job acked");
                if let Err(e) = self.source.ack(&job).await {
                    error!(queue = %self.name, error = %e, "ack failed");
                    return ControlFlow::Break(());
                }
                if !self.suspended {
                    self.poll_now();
                }
            }
            QueueEvent::Nack(job, delay) => {
                self.outstanding = self.outstanding.saturating_sub(1);
                if let Err(e) = self.source.nack(&job, delay).await {
                    error!(queue = %self.name, error = %e, "nack failed");
                    return ControlFlow::Break(());
                }
                if !self.suspended {
                    self.poll_now();
                }
            }
            QueueEvent::Suspend => {
                self.suspended = true;
                self.poll_at = None;
            }
            QueueEvent::Resume => {
                if self.suspended {
                    self.suspended = false;
                    self.poll_now();
                }
            }
            QueueEvent::Status(reply) => {
                let _ = reply.send(self.source.status().await.map_err(Into::into));
            }
            QueueEvent::Cancel(id, reply) => {
                let _ = reply.send(self.source.cancel(&id).await);
            }
            QueueEvent::Filter(selector, reply) => {
                let _ = reply.send(self.source.filter(selector).await.map_err(Into::into));
            }
            QueueEvent::Enqueue(job, reply) => {
                let result = self.source.enqueue(job).await.map_err(Into::into);
                if result.is_ok() && !self.suspended {
                    self.poll_now();
                }
                let _ = reply.send(result);
            }
            QueueEvent::Move(job, target, reply) => {
                let _ = reply.send(self.move_job(job, target).await);
            }
            QueueEvent::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// One reservation attempt. Strictly serial within the loop.
    async fn poll(&mut self) -> ControlFlow<()> {
        if self.suspended {
            return ControlFlow::Continue(());
        }
        match self.source.reserve().await {
            Ok(Some(job)) => {
                self.outstanding += 1;
                match self.free_workers.pop_front() {
                    Some(worker) => {
                        self.dispatch(job, worker).await;
                        if !self.free_workers.is_empty() && self.buffered.is_empty() {
                            self.poll_now();
                        }
                    }
                    // No free worker: hold the job and wait for one before
                    // reserving more.
                    None => self.buffered.push_back(job),
                }
            }
            Ok(None) => {
                self.poll_at = Some(Instant::now() + self.poll_interval);
            }
            Err(e) => {
                error!(queue = %self.name, error = %e, "reserve failed");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn dispatch(&mut self, job: Job, worker: WorkerHandle) {
        if let Err(send_error) = worker.tx.send(job).await {
            warn!(queue = %self.name, worker = worker.id, "worker went away, holding its job");
            self.buffered.push_front(send_error.0);
        }
    }

    async fn move_job(&mut self, job: Job, target: QueueName) -> Result<(), QueueError> {
        if target == self.name {
            return Err(QueueError::Config(ConfigError::Invalid {
                option: "queue",
                reason: "cannot move a job onto its own queue".into(),
            }));
        }
        let Some(handle) = self.registry.lookup(&target) else {
            return Err(QueueError::NoSuchQueue(target));
        };

        let mut original = job.clone();
        original.completed_at = None;
        self.source.ack(&original).await?;

        let mut copy = job;
        copy.queue = target;
        copy.private = None;
        copy.failure_private = None;
        copy.result = None;
        copy.completed_at = None;
        handle.enqueue(copy).await?;
        Ok(())
    }

    fn poll_now(&mut self) {
        self.poll_at = Some(Instant::now());
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source that only counts stale sweeps.
    struct SweepSource {
        sweeps: AtomicUsize,
        interval: Duration,
    }

    #[async_trait]
    impl PollSource for SweepSource {
        async fn reserve(&self) -> Result<Option<Job>, SourceError> {
            Ok(None)
        }

        async fn ack(&self, _job: &Job) -> Result<(), SourceError> {
            Ok(())
        }

        async fn nack(&self, _job: &Job, _delay: Duration) -> Result<(), SourceError> {
            Ok(())
        }

        async fn cancel(&self, _id: &RowId) -> Result<(), CancelError> {
            Err(CancelError::NotFound)
        }

        async fn status(&self) -> Result<QueueStatus, SourceError> {
            Ok(QueueStatus::default())
        }

        async fn filter(&self, _selector: FilterSelector) -> Result<Vec<Job>, SourceError> {
            Ok(Vec::new())
        }

        async fn reset_stale(&self) -> Result<(), SourceError> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn reset_stale_interval(&self) -> Option<Duration> {
            Some(self.interval)
        }
    }

    fn poll_loop(source: Arc<dyn PollSource>, suspended: bool) -> PollLoop {
        PollLoop {
            name: QueueName::local("test"),
            source,
            registry: Arc::new(Registry::new()),
            poll_interval: Duration::from_secs(10),
            suspended,
            outstanding: 0,
            free_workers: VecDeque::new(),
            buffered: VecDeque::new(),
            poll_at: None,
            workers: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn the_sweep_timer_rearms_every_interval() {
        let source = Arc::new(SweepSource {
            sweeps: AtomicUsize::new(0),
            interval: Duration::from_secs(300),
        });
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(poll_loop(Arc::clone(&source) as Arc<dyn PollSource>, false).run(rx));

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(source.sweeps.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(source.sweeps.load(Ordering::SeqCst), 2);

        let _ = tx.send(QueueEvent::Shutdown).await;
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_loops_do_not_poll() {
        let source = Arc::new(SweepSource {
            sweeps: AtomicUsize::new(0),
            interval: Duration::from_secs(3600),
        });

        struct CountingReserve {
            inner: Arc<SweepSource>,
            reserves: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl PollSource for CountingReserve {
            async fn reserve(&self) -> Result<Option<Job>, SourceError> {
                self.reserves.fetch_add(1, Ordering::SeqCst);
                self.inner.reserve().await
            }
            async fn ack(&self, job: &Job) -> Result<(), SourceError> {
                self.inner.ack(job).await
            }
            async fn nack(&self, job: &Job, delay: Duration) -> Result<(), SourceError> {
                self.inner.nack(job, delay).await
            }
            async fn cancel(&self, id: &RowId) -> Result<(), CancelError> {
                self.inner.cancel(id).await
            }
            async fn status(&self) -> Result<QueueStatus, SourceError> {
                self.inner.status().await
            }
            async fn filter(&self, selector: FilterSelector) -> Result<Vec<Job>, SourceError> {
                self.inner.filter(selector).await
            }
        }

        let reserves = Arc::new(AtomicUsize::new(0));
        let counting = Arc::new(CountingReserve {
            inner: source,
            reserves: Arc::clone(&reserves),
        });
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(poll_loop(counting as Arc<dyn PollSource>, true).run(rx));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reserves.load(Ordering::SeqCst), 0);

        let _ = tx.send(QueueEvent::Resume).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(reserves.load(Ordering::SeqCst) >= 1);

        let _ = tx.send(QueueEvent::Shutdown).await;
    }
}
