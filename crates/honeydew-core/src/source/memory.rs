//! In-memory poll source.
//!
//! The in-process instance of the [`PollSource`] port: a ready list plus a
//! min-heap of delayed jobs. Used by tests and as a lightweight target for
//! moved jobs; it has no stale sweep because its workers share the process
//! and die with it.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::domain::{Job, RowId};
use crate::error::{CancelError, SourceError};
use crate::observability::QueueStatus;
use crate::source::{FilterSelector, PollSource};

/// Delayed entry for the priority queue.
///
/// Reverse ordering so the BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, PartialEq, Eq)]
struct DelayedJob {
    ready_at: Instant,
    id: u64,
}

impl PartialOrd for DelayedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.ready_at.cmp(&self.ready_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Ready,
    Delayed,
    InProgress,
    Abandoned,
}

struct Slot {
    job: Job,
    state: SlotState,
}

struct MemoryState {
    /// All live jobs (single source of truth). Finished jobs leave the map.
    slots: HashMap<u64, Slot>,
    /// Ready ids in arrival order. Entries whose slot moved on are skipped
    /// lazily on reserve.
    ready: VecDeque<u64>,
    delayed: BinaryHeap<DelayedJob>,
    next_id: u64,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            ready: VecDeque::new(),
            delayed: BinaryHeap::new(),
            next_id: 1,
        }
    }

    /// Move delayed jobs whose time has come back to ready.
    fn promote_delayed(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.delayed.peek() {
            if entry.ready_at > now {
                break; // heap is sorted, nothing later can be due
            }
            let entry = self.delayed.pop().expect("peeked entry");
            if let Some(slot) = self.slots.get_mut(&entry.id) {
                if slot.state == SlotState::Delayed {
                    slot.state = SlotState::Ready;
                    self.ready.push_back(entry.id);
                }
            }
        }
    }
}

/// In-memory queue storage.
pub struct MemorySource {
    state: Mutex<MemoryState>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::new()),
        }
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_id(id: &RowId) -> Result<u64, SourceError> {
    id.first()
        .and_then(|(_, value)| value.as_u64())
        .ok_or_else(|| SourceError::Integrity("job carries no usable row handle".into()))
}

#[async_trait]
impl PollSource for MemorySource {
    async fn reserve(&self) -> Result<Option<Job>, SourceError> {
        let mut state = self.state.lock().await;
        state.promote_delayed();
        while let Some(id) = state.ready.pop_front() {
            if let Some(slot) = state.slots.get_mut(&id) {
                if slot.state == SlotState::Ready {
                    slot.state = SlotState::InProgress;
                    return Ok(Some(slot.job.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, job: &Job) -> Result<(), SourceError> {
        let id = slot_id(job.row_id().ok_or_else(|| {
            SourceError::Integrity("job carries no row handle".into())
        })?)?;
        let mut state = self.state.lock().await;
        if job.completed_at.is_some() {
            state.slots.remove(&id);
        } else if let Some(slot) = state.slots.get_mut(&id) {
            slot.state = SlotState::Abandoned;
        }
        Ok(())
    }

    async fn nack(&self, job: &Job, delay: Duration) -> Result<(), SourceError> {
        let id = slot_id(job.row_id().ok_or_else(|| {
            SourceError::Integrity("job carries no row handle".into())
        })?)?;
        let mut state = self.state.lock().await;
        let Some(slot) = state.slots.get_mut(&id) else {
            return Err(SourceError::Integrity(format!(
                "nack for unknown job {id}"
            )));
        };
        slot.job.failure_private = job.failure_private.clone();
        slot.state = SlotState::Delayed;
        let ready_at = Instant::now() + delay;
        state.delayed.push(DelayedJob { ready_at, id });
        Ok(())
    }

    async fn cancel(&self, id: &RowId) -> Result<(), CancelError> {
        let id = slot_id(id)?;
        let mut state = self.state.lock().await;
        match state.slots.get(&id).map(|slot| slot.state) {
            Some(SlotState::Ready) | Some(SlotState::Delayed) => {
                state.slots.remove(&id);
                Ok(())
            }
            Some(SlotState::InProgress) => Err(CancelError::InProgress),
            Some(SlotState::Abandoned) | None => Err(CancelError::NotFound),
        }
    }

    async fn status(&self) -> Result<QueueStatus, SourceError> {
        let mut state = self.state.lock().await;
        state.promote_delayed();
        let mut status = QueueStatus {
            total: state.slots.len() as u64,
            ..QueueStatus::default()
        };
        for slot in state.slots.values() {
            match slot.state {
                SlotState::Ready => status.ready += 1,
                SlotState::Delayed => status.delayed += 1,
                SlotState::InProgress => status.in_progress += 1,
                SlotState::Abandoned => status.abandoned += 1,
            }
        }
        Ok(status)
    }

    async fn filter(&self, selector: FilterSelector) -> Result<Vec<Job>, SourceError> {
        let state = self.state.lock().await;
        Ok(match selector {
            FilterSelector::Abandoned => state
                .slots
                .values()
                .filter(|slot| slot.state == SlotState::Abandoned)
                .map(|slot| slot.job.clone())
                .collect(),
        })
    }

    async fn enqueue(&self, mut job: Job) -> Result<Job, SourceError> {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        job.private = Some(vec![("id".to_owned(), serde_json::Value::from(id))]);
        state.slots.insert(
            id,
            Slot {
                job: job.clone(),
                state: SlotState::Ready,
            },
        );
        state.ready.push_back(id);
        Ok(job)
    }
}
