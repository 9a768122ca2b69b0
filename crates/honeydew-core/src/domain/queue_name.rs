//! Queue identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a queue.
///
/// A `Local` queue lives on one node; a `Global` queue is one logical queue
/// addressed by every node in the cluster. Both variants share the same
/// surface everywhere else in the crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    Local(String),
    Global(String),
}

impl QueueName {
    pub fn local(name: impl Into<String>) -> Self {
        QueueName::Local(name.into())
    }

    pub fn global(name: impl Into<String>) -> Self {
        QueueName::Global(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            QueueName::Local(name) | QueueName::Global(name) => name,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, QueueName::Global(_))
    }

    /// Column-safe rendering, used to derive the lock/private column names.
    ///
    /// Lowercased, any non-alphanumeric character replaced with `_`, and
    /// global names prefixed so they cannot collide with a local queue of
    /// the same name.
    pub fn column_token(&self) -> String {
        let sanitized: String = self
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        if self.is_global() {
            format!("global_{sanitized}")
        } else {
            sanitized
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueName::Local(name) => write!(f, "{name}"),
            QueueName::Global(name) => write!(f, "global:{name}"),
        }
    }
}

impl From<&str> for QueueName {
    fn from(name: &str) -> Self {
        QueueName::Local(name.to_owned())
    }
}
