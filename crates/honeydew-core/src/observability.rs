//! Status views over a queue's backing store.

use serde::{Deserialize, Serialize};

/// Row counts per lock-range state.
///
/// `total` counts every row in the table, including finished ones, so the
/// five state counts sum to at most `total`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total: u64,
    pub abandoned: u64,
    pub ready: u64,
    pub delayed: u64,
    pub stale: u64,
    pub in_progress: u64,
}
