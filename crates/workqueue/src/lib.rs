//! # Work Queue
//!
//! Deduplicating, rate-limited, at-least-once delivery queue of identity keys.
//!
//! - `add` collapses repeated notifications for the same key into one entry
//! - `get` hands a key to exactly one worker at a time
//! - `add_rate_limited` re-enqueues after exponential backoff, `forget` resets it
//! - `shutdown` wakes every blocked `get` and refuses new work

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod queue;
pub mod rate_limiter;
pub mod stats;

pub use queue::WorkQueue;
pub use rate_limiter::{
    BucketLimiter, ItemExponentialLimiter, MaxOfLimiter, RateLimiter, controller_limiter,
    default_controller_limiter,
};
pub use stats::{QueueStats, QueueStatsSnapshot};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate leaves the guarded state consistent
/// before any call that could unwind.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
