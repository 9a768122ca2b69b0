//! Queue registry: explicit membership keyed by queue name.
//!
//! Local and cluster-global names live behind the same surface; a global
//! name is simply a distinct key, so the same string can name both a local
//! and a global queue without collision.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::domain::{Job, QueueName};
use crate::error::QueueError;

use super::QueueHandle;

/// Maps queue names to running queue handles.
#[derive(Default)]
pub struct Registry {
    queues: RwLock<HashMap<QueueName, QueueHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: QueueHandle) -> Result<(), QueueError> {
        let mut queues = self
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let name = handle.name().clone();
        if queues.contains_key(&name) {
            return Err(QueueError::AlreadyRegistered(name));
        }
        queues.insert(name, handle);
        Ok(())
    }

    pub fn lookup(&self, name: &QueueName) -> Option<QueueHandle> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn unregister(&self, name: &QueueName) -> Option<QueueHandle> {
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Enqueue on whatever queue the job names; errors when no queue
    /// process is running under that name.
    pub async fn enqueue(&self, job: Job) -> Result<Job, QueueError> {
        match self.lookup(&job.queue) {
            Some(handle) => handle.enqueue(job).await,
            None => Err(QueueError::NoSuchQueue(job.queue)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle(name: QueueName) -> QueueHandle {
        let (tx, _rx) = mpsc::channel(1);
        QueueHandle { name, tx }
    }

    #[test]
    fn register_and_lookup() {
        let registry = Registry::new();
        registry.register(handle(QueueName::local("photos"))).unwrap();

        assert!(registry.lookup(&QueueName::local("photos")).is_some());
        assert!(registry.lookup(&QueueName::local("videos")).is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = Registry::new();
        registry.register(handle(QueueName::local("photos"))).unwrap();

        let err = registry
            .register(handle(QueueName::local("photos")))
            .unwrap_err();
        assert!(matches!(err, QueueError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn enqueue_routes_to_the_named_queue() {
        use crate::domain::Task;
        use crate::handlers::Handlers;
        use crate::queue::{spawn, QueueOptions};
        use crate::source::MemorySource;
        use std::sync::Arc;

        let registry = Arc::new(Registry::new());
        spawn(
            QueueName::local("photos"),
            Arc::new(MemorySource::new()),
            Arc::new(Handlers::new()),
            Arc::clone(&registry),
            QueueOptions {
                workers: 1,
                suspended: true,
                ..QueueOptions::default()
            },
        )
        .unwrap();

        let job = Job::new(
            QueueName::local("photos"),
            Task::new("run", serde_json::json!([])),
        );
        registry.enqueue(job).await.unwrap();

        let stray = Job::new(
            QueueName::local("videos"),
            Task::new("run", serde_json::json!([])),
        );
        assert!(matches!(
            registry.enqueue(stray).await,
            Err(QueueError::NoSuchQueue(_))
        ));
    }

    #[test]
    fn global_and_local_names_do_not_collide() {
        let registry = Registry::new();
        registry.register(handle(QueueName::local("photos"))).unwrap();
        registry.register(handle(QueueName::global("photos"))).unwrap();

        assert!(registry.unregister(&QueueName::global("photos")).is_some());
        assert!(registry.lookup(&QueueName::local("photos")).is_some());
    }
}
