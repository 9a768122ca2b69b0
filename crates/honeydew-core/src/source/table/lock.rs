//! The lock-column state machine.
//!
//! One signed 64-bit column encodes a row's whole queue life. Interpreted
//! as milliseconds since the Unix epoch, its value falls into one of six
//! non-overlapping ranges; the constants below carve those ranges so that
//! delayed retries sort after ready jobs but before any live lock value,
//! and every value is directly comparable to "now".

/// Shift defining the ready watermark: `now - FAR_IN_THE_PAST_MS` (~24
/// years). Rows inserted with the column default land just below it.
pub const FAR_IN_THE_PAST_MS: i64 = 757_382_400_000;

/// Span separating delayed from stale lock values (5 years).
pub const STALE_WINDOW_MS: i64 = 157_788_000_000;

/// Terminal marker for abandoned rows. Nothing in the core moves a row out
/// of it; that is an administrator's call.
pub const ABANDONED: i64 = -1;

/// Upper bound of the ready range at `now_ms`.
pub fn ready_watermark(now_ms: i64) -> i64 {
    now_ms - FAR_IN_THE_PAST_MS
}

/// Semantic state encoded by a lock value at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// NULL: the row is not (or no longer) a job.
    Finished,
    /// Negative: terminal failure, never reserved again.
    Abandoned,
    /// `[0, watermark]`: eligible for reservation.
    Ready,
    /// `(watermark, now - stale window)`: scheduled for a future attempt.
    Delayed,
    /// `[now - stale window, now)`: reserved by a worker that has since died.
    Stale,
    /// `[now, ...)`: a worker currently holds it.
    InProgress,
}

pub fn classify(lock: Option<i64>, now_ms: i64) -> LockState {
    match lock {
        None => LockState::Finished,
        Some(v) if v < 0 => LockState::Abandoned,
        Some(v) if v <= ready_watermark(now_ms) => LockState::Ready,
        Some(v) if v < now_ms - STALE_WINDOW_MS => LockState::Delayed,
        Some(v) if v < now_ms => LockState::Stale,
        Some(_) => LockState::InProgress,
    }
}
