//! Fixed pool of long-lived reconcile workers.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use converge_core::{Error, ObjectKey, Resource, ShutdownSignal};
use converge_workqueue::WorkQueue;
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::reconciler::Reconciler;
use crate::types::{ReconcilePath, ReconcileReport, Reconciliation, SyncOutcome};

/// Workers pulling keys from a queue and reconciling them.
pub struct WorkerPool<K> {
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<Reconciler<K>>,
    reports: broadcast::Sender<ReconcileReport>,
    standing_condition_after: u32,
}

impl<K> Clone for WorkerPool<K> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            reconciler: Arc::clone(&self.reconciler),
            reports: self.reports.clone(),
            standing_condition_after: self.standing_condition_after,
        }
    }
}

impl<K: Resource> WorkerPool<K> {
    /// Build a pool that takes keys from `queue` and publishes one report per
    /// pass. Keys requeued `standing_condition_after` times or more are
    /// reported as a standing condition.
    #[must_use]
    pub fn new(
        queue: WorkQueue<ObjectKey>,
        reconciler: Arc<Reconciler<K>>,
        reports: broadcast::Sender<ReconcileReport>,
        standing_condition_after: u32,
    ) -> Self {
        Self {
            queue,
            reconciler,
            reports,
            standing_condition_after,
        }
    }

    /// Run `count` workers until `shutdown` fires or the queue shuts down.
    ///
    /// Returns once every worker has exited. A worker that is mid-pass
    /// finishes that pass first.
    pub async fn run(&self, count: usize, shutdown: ShutdownSignal) {
        info!(workers = count, queue = self.queue.name(), "Starting worker pool");

        let mut workers = JoinSet::new();
        for id in 0..count {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { pool.work(id, shutdown).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }

        info!("Worker pool stopped");
    }

    async fn work(&self, id: usize, shutdown: ShutdownSignal) {
        debug!(worker = id, "Worker started");
        loop {
            let key = tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            self.process(id, key).await;
        }
        debug!(worker = id, "Worker exited");
    }

    /// Reconcile one key and settle it with the queue.
    async fn process(&self, worker: usize, key: ObjectKey) {
        let started = Instant::now();

        let Reconciliation { path, outcome } = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!(worker, key = %key, panic = %message, "Reconcile panicked");
                Reconciliation::new(
                    ReconcilePath::Aborted,
                    SyncOutcome::RetryableError(Error::worker_panicked(&key, message)),
                )
            });

        let mut requeue_delay = None;
        let mut standing_condition = false;

        match &outcome {
            SyncOutcome::Done => {
                self.queue.forget(&key);
                debug!(worker, key = %key, path = %path, "Synced");
            }
            SyncOutcome::RetryableError(e) => {
                let delay = self.queue.add_rate_limited(key.clone());
                let requeues = self.queue.num_requeues(&key);
                requeue_delay = Some(delay);
                standing_condition = requeues >= self.standing_condition_after;
                if standing_condition {
                    error!(
                        worker,
                        key = %key,
                        error = %e,
                        attempt = requeues,
                        delay_ms = delay.as_millis(),
                        "Standing condition: key keeps failing"
                    );
                } else {
                    warn!(
                        worker,
                        key = %key,
                        error = %e,
                        attempt = requeues,
                        delay_ms = delay.as_millis(),
                        "Sync failed, requeueing"
                    );
                }
            }
            SyncOutcome::TerminalError(e) => {
                self.queue.forget(&key);
                error!(worker, key = %key, error = %e, "Sync failed permanently, dropping key");
            }
        }

        let requeues = self.queue.num_requeues(&key);
        self.queue.done(&key);

        // Nobody listening is fine.
        let _ = self.reports.send(ReconcileReport {
            key,
            worker,
            path,
            outcome,
            requeues,
            requeue_delay,
            standing_condition,
            duration: started.elapsed(),
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
