//! Controller wiring: informer → translator → queue → worker pool.

use std::sync::Arc;

use converge_cache::{Informer, ListWatch, NotificationStream, Store};
use converge_core::{ObjectKey, Resource, Result, ShutdownSignal};
use converge_workqueue::{QueueStatsSnapshot, WorkQueue};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::ControllerConfig;
use crate::handler::SyncHandler;
use crate::reconciler::Reconciler;
use crate::translator::EventTranslator;
use crate::types::ReconcileReport;
use crate::worker::WorkerPool;

const REPORT_CAPACITY: usize = 1024;

/// A complete control loop for one resource kind.
pub struct Controller<K> {
    name: String,
    informer: Arc<Informer<K>>,
    notifications: NotificationStream<K>,
    queue: WorkQueue<ObjectKey>,
    pool: WorkerPool<K>,
    reports: broadcast::Sender<ReconcileReport>,
    config: ControllerConfig,
}

impl<K: Resource> Controller<K> {
    /// Wire up a controller. Nothing runs until [`Self::run`].
    ///
    /// # Errors
    ///
    /// Returns [`converge_core::Error::InvalidConfig`] if `config` fails validation.
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn ListWatch<K>>,
        handler: Arc<dyn SyncHandler<K>>,
        config: ControllerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();

        let (informer, notifications) = Informer::new(source, config.informer());
        let queue = WorkQueue::with_rate_limiter(name.clone(), config.rate_limit.limiter());
        let reconciler = Arc::new(Reconciler::new(informer.store(), handler));
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        let pool = WorkerPool::new(
            queue.clone(),
            reconciler,
            reports.clone(),
            config.standing_condition_after,
        );

        Ok(Self {
            name,
            informer: Arc::new(informer),
            notifications,
            queue,
            pool,
            reports,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read handle to the controller's cache.
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.informer.store()
    }

    /// Handle to the work queue, for inspection.
    #[must_use]
    pub fn queue(&self) -> WorkQueue<ObjectKey> {
        self.queue.clone()
    }

    #[must_use]
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.queue.stats()
    }

    /// Subscribe to per-key outcome reports. Subscribe before [`Self::run`]
    /// to see every pass.
    #[must_use]
    pub fn reports(&self) -> broadcast::Receiver<ReconcileReport> {
        self.reports.subscribe()
    }

    /// Run until `shutdown` fires.
    ///
    /// Workers start only after the cache has synced. On shutdown the queue
    /// stops handing out keys and in-flight passes get `drain_timeout` to
    /// finish.
    ///
    /// # Errors
    ///
    /// Returns [`converge_core::Error::CacheSyncTimeout`] if the cache does not
    /// sync within `cache_sync_timeout`; no worker is started in that case.
    /// A shutdown requested before the sync completes returns `Ok(())`.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<()> {
        let Self {
            name,
            informer,
            notifications,
            queue,
            pool,
            config,
            ..
        } = self;

        info!(controller = %name, workers = config.workers, "Starting controller");

        let informer_task = {
            let informer = Arc::clone(&informer);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { informer.run(shutdown).await })
        };
        let translator_task = {
            let translator = EventTranslator::new(queue.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move { translator.run(notifications, shutdown).await })
        };

        info!(controller = %name, timeout_ms = config.cache_sync_timeout.as_millis(), "Waiting for cache sync");
        let synced = tokio::select! {
            biased;
            reason = shutdown.triggered() => {
                info!(controller = %name, reason = ?reason, "Shutdown requested before cache sync");
                Ok(false)
            }
            result = informer.wait_for_sync(config.cache_sync_timeout) => result.map(|()| true),
        };
        let early_exit = match synced {
            Ok(true) => None,
            Ok(false) => Some(Ok(())),
            Err(e) => {
                error!(controller = %name, error = %e, "Cache failed to sync, not starting workers");
                Some(Err(e))
            }
        };
        if let Some(result) = early_exit {
            informer_task.abort();
            translator_task.abort();
            queue.shutdown();
            return result;
        }
        info!(controller = %name, cached = informer.store().len(), "Cache synced, starting workers");

        let workers = config.workers;
        let pool_task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(workers, shutdown).await })
        };

        let reason = shutdown.triggered().await;
        info!(controller = %name, reason = ?reason, "Controller shutting down");

        let drained = queue.shutdown_with_drain(config.drain_timeout).await;
        if !drained {
            warn!(
                controller = %name,
                in_flight = queue.in_flight(),
                "Drain timed out, abandoning in-flight keys"
            );
        }

        for (task, handle) in [("informer", informer_task), ("translator", translator_task), ("workers", pool_task)] {
            let abort = handle.abort_handle();
            if tokio::time::timeout(config.drain_timeout, handle).await.is_err() {
                warn!(controller = %name, task, "Task did not stop in time, aborting");
                abort.abort();
            }
        }

        info!(controller = %name, "Controller stopped");
        Ok(())
    }
}
