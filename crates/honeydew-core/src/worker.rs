//! Worker pool and execution monitor.
//!
//! Workers advertise themselves to the queue loop, receive one job per
//! advertisement, and run it under a monitor that contains panics and
//! routes the outcome. An aborted worker sends nothing at all; that is the
//! crash case, rescued by the source's stale sweep.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{Job, JobResult};
use crate::failure::{FailureContext, FailureMode, SuccessMode};
use crate::handlers::Handlers;
use crate::queue::poll::{QueueControl, QueueEvent, WorkerHandle};
use crate::queue::Registry;

/// Everything a monitor needs to route an execution outcome.
pub struct ExecutionContext {
    pub queue: QueueControl,
    pub registry: Arc<Registry>,
    pub failure_mode: Arc<dyn FailureMode>,
    pub success_mode: Option<Arc<dyn SuccessMode>>,
}

impl ExecutionContext {
    fn failure_context(&self) -> FailureContext {
        FailureContext {
            queue: self.queue.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

/// Worker group handle. Dropping it alone does not stop the workers;
/// shutdown comes from the owning queue loop.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        n: usize,
        handlers: Arc<Handlers>,
        queue_tx: mpsc::Sender<QueueEvent>,
        ctx: Arc<ExecutionContext>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let handlers = Arc::clone(&handlers);
            let ctx = Arc::clone(&ctx);
            let queue_tx = queue_tx.clone();
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, handlers, queue_tx, ctx, &mut rx).await;
            }));
        }

        Self { shutdown_tx, joins }
    }

    /// Stop taking new jobs; in-flight handlers are not interrupted.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    handlers: Arc<Handlers>,
    queue_tx: mpsc::Sender<QueueEvent>,
    ctx: Arc<ExecutionContext>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    debug!(worker_id, "worker starting");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // One advertisement, one job: the queue loop holds the sending half
        // until it has something for us.
        let (job_tx, mut job_rx) = mpsc::channel(1);
        let handle = WorkerHandle {
            id: worker_id,
            tx: job_tx,
        };
        if queue_tx
            .send(QueueEvent::WorkerReady(handle))
            .await
            .is_err()
        {
            break; // queue is gone
        }

        let job = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            job = job_rx.recv() => match job {
                Some(job) => job,
                None => continue,
            },
        };

        run_job(worker_id, job, &handlers, &ctx).await;
    }
    debug!(worker_id, "worker stopped");
}

/// Execution monitor: run the task in its own spawned task so panics are
/// contained, then route the outcome.
async fn run_job(worker_id: usize, mut job: Job, handlers: &Arc<Handlers>, ctx: &ExecutionContext) {
    let task = job.task.clone();
    let handlers = Arc::clone(handlers);
    let execution = tokio::spawn(async move { handlers.run(&task).await });

    match execution.await {
        Ok(Ok(value)) => {
            job.mark_completed();
            job.result = Some(JobResult::Ok(value));
            job.send_reply();
            if let Some(success_mode) = &ctx.success_mode {
                success_mode.handle_success(&job).await;
            }
            ctx.queue.ack(job).await;
        }
        Ok(Err(reason)) => {
            debug!(worker_id, %reason, "task failed");
            ctx.failure_mode
                .handle_failure(job, reason, &ctx.failure_context())
                .await;
        }
        Err(join_error) => {
            if join_error.is_panic() {
                let reason = panic_reason(join_error.into_panic());
                warn!(worker_id, %reason, "task panicked");
                ctx.failure_mode
                    .handle_failure(job, reason, &ctx.failure_context())
                    .await;
            }
            // Aborted: the crashed-worker case. No ack ever arrives and the
            // stale sweep restores the row.
        }
    }
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_owned()
    }
}
