//! Task dispatch.
//!
//! Tasks travel as `(name, args)` pairs, so somebody has to turn a name
//! back into code. That somebody is [`Handlers`]: the callables a worker
//! pool is constructed with, frozen before the first job runs. Dispatch is
//! a plain map lookup, no locking, and an unknown name is just another way
//! for a job to fail.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::Task;
use crate::error::ConfigError;

/// One callable.
///
/// Takes the task's JSON arguments and returns the value delivered on the
/// caller's reply channel. Errors are plain reasons; what happens to a
/// failed job is the failure mode's decision, not the handler's.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, args: &serde_json::Value) -> Result<serde_json::Value, String>;
}

/// The callables a worker pool executes, keyed by task name.
#[derive(Default)]
pub struct Handlers {
    by_name: HashMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("names", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler under `name`, consuming and returning the set so
    /// construction reads as one chain. Two handlers for one name is a
    /// configuration mistake and is caught here, not at dispatch time.
    pub fn with(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if self.by_name.insert(name.clone(), handler).is_some() {
            return Err(ConfigError::DuplicateHandler(name));
        }
        Ok(self)
    }

    /// Run one task. An unknown name is an execution failure like any
    /// other: the reason reaches the failure mode, the queue process never
    /// hears about it.
    pub async fn run(&self, task: &Task) -> Result<serde_json::Value, String> {
        match self.by_name.get(task.name()) {
            Some(handler) => handler.handle(task.args()).await,
            None => Err(format!("no handler registered for task {}", task.name())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Doubler;

    #[async_trait]
    impl TaskHandler for Doubler {
        async fn handle(&self, args: &serde_json::Value) -> Result<serde_json::Value, String> {
            let n = args[0].as_i64().ok_or("expected an integer")?;
            Ok(json!(n * 2))
        }
    }

    struct Rejecter;

    #[async_trait]
    impl TaskHandler for Rejecter {
        async fn handle(&self, _args: &serde_json::Value) -> Result<serde_json::Value, String> {
            Err("nope".to_owned())
        }
    }

    #[tokio::test]
    async fn dispatch_picks_the_handler_by_task_name() {
        let handlers = Handlers::new()
            .with("double", Arc::new(Doubler))
            .unwrap()
            .with("reject", Arc::new(Rejecter))
            .unwrap();

        let doubled = handlers.run(&Task::new("double", json!([21]))).await;
        assert_eq!(doubled, Ok(json!(42)));

        let rejected = handlers.run(&Task::new("reject", json!([]))).await;
        assert_eq!(rejected, Err("nope".to_owned()));
    }

    #[tokio::test]
    async fn unknown_names_fail_with_the_name_in_the_reason() {
        let handlers = Handlers::new();
        let reason = handlers
            .run(&Task::new("resize", json!([])))
            .await
            .unwrap_err();
        assert!(reason.contains("resize"));
    }

    #[test]
    fn one_name_takes_one_handler() {
        let err = Handlers::new()
            .with("double", Arc::new(Doubler))
            .unwrap()
            .with("double", Arc::new(Doubler))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateHandler(name) if name == "double"));
    }
}
