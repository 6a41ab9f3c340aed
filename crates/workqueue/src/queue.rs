//! The work queue.
//!
//! Keys move through three sets guarded by one lock:
//!
//! - `dirty`: keys that need processing (pending, or re-added while in flight)
//! - `processing`: keys handed to a worker and not yet `done`
//! - `waiting`: keys parked on a backoff timer
//!
//! A key is in `queue` only if it is dirty and not processing, which gives the
//! two core guarantees: repeated adds collapse into one entry, and no key is
//! handed to two workers at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::lock;
use crate::rate_limiter::{RateLimiter, default_controller_limiter};
use crate::stats::{QueueStats, QueueStatsSnapshot};

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    waiting: HashMap<T, Waiting>,
    next_ticket: u64,
    shutting_down: bool,
}

/// A key parked on a backoff timer.
struct Waiting {
    deadline: Instant,
    ticket: u64,
    timer: AbortHandle,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: HashMap::new(),
            next_ticket: 0,
            shutting_down: false,
        }
    }
}

struct Shared<T> {
    name: String,
    state: std::sync::Mutex<State<T>>,
    /// Wakes `get` callers when a key becomes ready or on shutdown.
    ready: Notify,
    /// Wakes drainers when the processing set empties.
    drained: Notify,
    /// Cancels pending backoff timers.
    shutdown_tx: watch::Sender<bool>,
    limiter: Box<dyn RateLimiter<T>>,
    stats: QueueStats,
}

/// Deduplicating, rate-limited queue of keys. Cheap to clone.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + std::fmt::Display + Send + Sync + 'static,
{
    /// Create a queue using [`default_controller_limiter`].
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, default_controller_limiter())
    }

    /// Create a queue with a custom rate limiter.
    #[must_use]
    pub fn with_rate_limiter(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: std::sync::Mutex::new(State::default()),
                ready: Notify::new(),
                drained: Notify::new(),
                shutdown_tx,
                limiter: Box::new(limiter),
                stats: QueueStats::default(),
            }),
        }
    }

    /// Name used in log fields.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Mark `item` as needing processing.
    ///
    /// A key that is already pending is not added twice. A key that is in
    /// flight is re-queued when its current pass calls [`done`](Self::done).
    /// Ignored after shutdown.
    pub fn add(&self, item: T) {
        let mut state = lock(&self.shared.state);
        if state.shutting_down {
            trace!(queue = %self.shared.name, key = %item, "Queue shutting down, add ignored");
            return;
        }
        if state.dirty.contains(&item) {
            self.shared.stats.record_dedup();
            trace!(queue = %self.shared.name, key = %item, "Key already pending");
            return;
        }

        self.shared.stats.record_add();
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(queue = %self.shared.name, key = %item, "Key in flight, will requeue on done");
            return;
        }

        state.queue.push_back(item);
        drop(state);
        self.shared.ready.notify_one();
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shutting down. The returned key is in
    /// flight until [`done`](Self::done) is called for it.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = lock(&self.shared.state);
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.shared.ready.notify_one();
                    }
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// End the in-flight pass for `item`.
    pub fn done(&self, item: &T) {
        let mut state = lock(&self.shared.state);
        if !state.processing.remove(item) {
            return;
        }
        self.shared.stats.record_done();

        let requeue = !state.shutting_down && state.dirty.contains(item);
        if requeue {
            state.queue.push_back(item.clone());
        }
        let idle = state.processing.is_empty();
        drop(state);

        if requeue {
            self.shared.ready.notify_one();
        }
        if idle {
            self.shared.drained.notify_waiters();
        }
    }

    /// Clear the retry history of `item`.
    pub fn forget(&self, item: &T) {
        self.shared.limiter.forget(item);
    }

    /// Retries recorded for `item` since the last [`forget`](Self::forget).
    #[must_use]
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.shared.limiter.num_requeues(item)
    }

    /// Re-add `item` after the rate limiter's delay. Returns that delay.
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let delay = self.shared.limiter.when(&item);
        self.shared.stats.record_retry();
        debug!(
            queue = %self.shared.name,
            key = %item,
            delay_ms = delay.as_millis(),
            "Requeueing with backoff"
        );
        self.add_after(item, delay);
        delay
    }

    /// Add `item` once `delay` has elapsed.
    ///
    /// If `item` is already waiting with an earlier deadline, the earlier
    /// deadline is kept. A later deadline is cancelled and replaced.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let Some(deadline) = Instant::now().checked_add(delay) else {
            warn!(queue = %self.shared.name, key = %item, "Delay overflows the clock, adding now");
            self.add(item);
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(queue = %self.shared.name, key = %item, "No runtime for delayed add, adding now");
            self.add(item);
            return;
        };

        let mut state = lock(&self.shared.state);
        if state.shutting_down {
            return;
        }
        if let Some(existing) = state.waiting.get(&item) {
            if existing.deadline <= deadline {
                return;
            }
            existing.timer.abort();
        }
        let ticket = state.next_ticket;
        state.next_ticket = ticket.wrapping_add(1);

        let queue = self.clone();
        let key = item.clone();
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        let timer = runtime
            .spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => queue.fire(key, ticket),
                    _ = shutdown_rx.wait_for(|stopped| *stopped) => {}
                }
            })
            .abort_handle();
        state.waiting.insert(
            item,
            Waiting {
                deadline,
                ticket,
                timer,
            },
        );
    }

    fn fire(&self, item: T, ticket: u64) {
        let current = {
            let mut state = lock(&self.shared.state);
            let current = state.waiting.get(&item).map(|w| w.ticket) == Some(ticket);
            if current {
                state.waiting.remove(&item);
            }
            current
        };
        if current {
            self.add(item);
        }
    }

    /// Number of keys ready to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    /// Whether no key is ready to be handed out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently held by workers.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.state).processing.len()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        lock(&self.shared.state).shutting_down
    }

    /// Counters plus current depth.
    #[must_use]
    pub fn stats(&self) -> QueueStatsSnapshot {
        let state = lock(&self.shared.state);
        self.shared
            .stats
            .snapshot(state.queue.len(), state.processing.len(), state.waiting.len())
    }

    /// Stop accepting work and wake every waiting `get`.
    pub fn shutdown(&self) {
        {
            let mut state = lock(&self.shared.state);
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.waiting.clear();
            debug!(
                queue = %self.shared.name,
                pending = state.queue.len(),
                in_flight = state.processing.len(),
                "Shutting down queue"
            );
        }
        self.shared.shutdown_tx.send_replace(true);
        self.shared.ready.notify_waiters();
    }

    /// Shut down, then wait up to `timeout` for in-flight keys to finish.
    ///
    /// Returns `true` if every in-flight key was `done` before the timeout.
    pub async fn shutdown_with_drain(&self, timeout: Duration) -> bool {
        self.shutdown();
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if lock(&self.shared.state).processing.is_empty() {
                return true;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        warn!(
                            queue = %self.shared.name,
                            in_flight = self.in_flight(),
                            "Drain timed out"
                        );
                        return false;
                    }
                }
                None => notified.await,
            }
        }
    }
}
