//! Job record and the reply channel.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::queue_name::QueueName;
use super::task::Task;

/// Ordered primary-key `(field, value)` pairs identifying a reserved row.
///
/// Compound keys list every field in schema order; values are whatever the
/// schema adapter loaded, treated opaquely from here on.
pub type RowId = Vec<(String, serde_json::Value)>;

/// Outcome delivered on the reply channel after execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    /// The task returned a value.
    Ok(serde_json::Value),
    /// The task failed or panicked; carries the reason.
    Exit(String),
    /// A failure mode rerouted the job to another queue.
    Moved(String),
}

/// Sending half of a job's reply channel.
///
/// Delivery is at-least-once: a second arrival of the same job's result is
/// possible and intentional.
#[derive(Clone)]
pub struct Reply {
    tx: mpsc::UnboundedSender<Job>,
}

impl Reply {
    pub fn channel() -> (Self, Receipt) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, Receipt { rx })
    }

    /// Deliver a populated copy of the job. A gone caller is not an error.
    pub fn send(&self, job: Job) {
        let _ = self.tx.send(job);
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reply(..)")
    }
}

/// Caller-side half of the reply channel.
///
/// Only the holder of the receipt can wait for the result, which is what
/// makes the reply protocol single-caller by construction.
pub struct Receipt {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl Receipt {
    /// Wait up to `timeout` for the executed job's result.
    ///
    /// Returns `None` on timeout without disturbing the job.
    pub async fn recv(&mut self, timeout: Duration) -> Option<JobResult> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(job)) => job.result,
            Ok(None) | Err(_) => None,
        }
    }
}

/// One unit of work plus its lifecycle metadata.
#[derive(Debug, Clone)]
pub struct Job {
    pub queue: QueueName,
    pub task: Task,
    /// Backend handle; for table-backed queues the ordered pk pairs of the
    /// reserved row. Absent until the backend has placed the job.
    pub private: Option<RowId>,
    /// Opaque blob persisted between attempts (retry counters and the like).
    pub failure_private: Option<serde_json::Value>,
    /// Where to send a populated copy after execution, if anywhere.
    pub from: Option<Reply>,
    pub result: Option<JobResult>,
    /// Epoch milliseconds; present only once the task finished executing.
    /// An ack without it finalizes the row as abandoned instead.
    pub completed_at: Option<i64>,
}

impl Job {
    pub fn new(queue: QueueName, task: Task) -> Self {
        Self {
            queue,
            task,
            private: None,
            failure_private: None,
            from: None,
            result: None,
            completed_at: None,
        }
    }

    /// Same job with a reply address attached; the receipt goes to the caller.
    pub fn with_reply(mut self) -> (Self, Receipt) {
        let (reply, receipt) = Reply::channel();
        self.from = Some(reply);
        (self, receipt)
    }

    pub fn row_id(&self) -> Option<&RowId> {
        self.private.as_ref()
    }

    pub fn mark_completed(&mut self) {
        self.completed_at = Some(epoch_ms());
    }

    /// Send a populated copy of this job to its reply address, if any.
    pub fn send_reply(&self) {
        if let Some(from) = &self.from {
            from.send(self.clone());
        }
    }
}

pub(crate) fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> Job {
        Job::new(QueueName::local("photos"), Task::new("run", json!([1])))
    }

    #[tokio::test]
    async fn reply_round_trip() {
        let (mut job, mut receipt) = job().with_reply();
        job.result = Some(JobResult::Ok(json!("done")));
        job.send_reply();

        let result = receipt.recv(Duration::from_millis(100)).await;
        assert_eq!(result, Some(JobResult::Ok(json!("done"))));
    }

    #[tokio::test]
    async fn recv_times_out_with_none() {
        let (_job, mut receipt) = job().with_reply();
        let result = receipt.recv(Duration::from_millis(10)).await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn second_arrival_is_observable() {
        let (mut job, mut receipt) = job().with_reply();
        job.result = Some(JobResult::Exit("boom".into()));
        job.send_reply();
        job.send_reply();

        assert!(receipt.recv(Duration::from_millis(100)).await.is_some());
        assert!(receipt.recv(Duration::from_millis(100)).await.is_some());
    }

    #[test]
    fn jobs_without_reply_are_cheap_to_clone() {
        let job = job();
        let copy = job.clone();
        assert_eq!(copy.task.name(), "run");
        assert!(copy.completed_at.is_none());
    }
}
