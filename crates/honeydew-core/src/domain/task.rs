//! The unit of work carried by a job.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A task on the wire: a handler name plus JSON arguments.
///
/// Workers resolve `name` against the handler registry they were built
/// with; the framework never reflects on the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    name: String,
    args: serde_json::Value,
}

impl Task {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &serde_json::Value {
        &self.args
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.args)
    }
}
