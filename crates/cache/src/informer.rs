//! The informer: list, then watch, then relist on any break.
//!
//! The informer owns the only writable view of the [`Store`]. Every change it
//! applies is followed by a [`Notification`] on an unbounded channel, so the
//! store lock is never held while downstream code runs and the delivery loop
//! never waits on a slow consumer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use converge_core::{Error, ObjectKey, Resource, Result, ResultExt, ShutdownSignal};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::source::{ListWatch, WatchEvent};
use crate::store::Store;

/// A change applied to the cache.
#[derive(Debug)]
pub enum Notification<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    /// `final_state_unknown` is set when the deletion was inferred from a
    /// relist rather than observed on the watch; `object` is then the last
    /// state the cache held.
    Deleted {
        object: Arc<K>,
        final_state_unknown: bool,
    },
}

impl<K> Notification<K> {
    /// The most recent state carried by this notification.
    pub const fn object(&self) -> &Arc<K> {
        match self {
            Self::Added(object) | Self::Updated { new: object, .. } | Self::Deleted { object, .. } => {
                object
            }
        }
    }
}

impl<K> Clone for Notification<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Added(o) => Self::Added(Arc::clone(o)),
            Self::Updated { old, new } => Self::Updated {
                old: Arc::clone(old),
                new: Arc::clone(new),
            },
            Self::Deleted {
                object,
                final_state_unknown,
            } => Self::Deleted {
                object: Arc::clone(object),
                final_state_unknown: *final_state_unknown,
            },
        }
    }
}

/// Receiving end of the informer's notifications.
pub struct NotificationStream<K> {
    rx: mpsc::UnboundedReceiver<Notification<K>>,
}

impl<K> NotificationStream<K> {
    /// Receive the next notification; `None` once the informer is gone.
    pub async fn recv(&mut self) -> Option<Notification<K>> {
        self.rx.recv().await
    }

    /// Receive a notification if one is ready.
    pub fn try_recv(&mut self) -> Option<Notification<K>> {
        self.rx.try_recv().ok()
    }
}

/// Informer tuning.
#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Re-deliver every cached object this often; zero disables resync.
    pub resync_period: Duration,
    /// First delay after a failed list or watch.
    pub relist_base_delay: Duration,
    /// Cap on the delay between failed attempts.
    pub relist_max_delay: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(600),
            relist_base_delay: Duration::from_millis(100),
            relist_max_delay: Duration::from_secs(30),
        }
    }
}

impl InformerConfig {
    fn relist_delay(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.relist_base_delay.checked_mul(factor))
            .map_or(self.relist_max_delay, |d| d.min(self.relist_max_delay))
    }
}

/// Keeps a [`Store`] in step with a remote collection.
pub struct Informer<K> {
    source: Arc<dyn ListWatch<K>>,
    store: Store<K>,
    tx: mpsc::UnboundedSender<Notification<K>>,
    synced: watch::Sender<bool>,
    config: InformerConfig,
}

impl<K: Resource> Informer<K> {
    /// Create an informer and the stream its notifications arrive on.
    pub fn new(source: Arc<dyn ListWatch<K>>, config: InformerConfig) -> (Self, NotificationStream<K>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (synced, _) = watch::channel(false);
        let informer = Self {
            source,
            store: Store::new(),
            tx,
            synced,
            config,
        };
        (informer, NotificationStream { rx })
    }

    /// Read handle to the cache.
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Whether the initial listing has been applied.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait up to `timeout` for the initial listing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheSyncTimeout`] if the cache is still unsynced.
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.synced.subscribe();
        let synced = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await,
            Ok(Ok(_))
        );
        if synced {
            Ok(())
        } else {
            Err(Error::CacheSyncTimeout { waited: timeout })
        }
    }

    /// Synchronize until `shutdown` fires.
    ///
    /// List or watch failures never end the loop; they are logged and the
    /// collection is relisted after a capped exponential delay. A watch that
    /// closes cleanly is relisted after `relist_base_delay`.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        info!(
            resync_secs = self.config.resync_period.as_secs(),
            "Starting informer"
        );
        let mut failures: u32 = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                outcome = self.list_and_watch() => outcome,
            };

            let delay = match outcome {
                Ok(()) => {
                    failures = 0;
                    debug!("Watch closed, relisting");
                    self.config.relist_base_delay
                }
                Err(e) => {
                    let delay = self.config.relist_delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(error = %e, attempt = failures, delay_ms = delay.as_millis(), "List/watch failed");
                    delay
                }
            };
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!("Informer stopped");
    }

    async fn list_and_watch(&self) -> Result<()> {
        let listing = self.source.list().await?;
        let resource_version = listing.resource_version;
        self.replace(listing.items);

        if !self.synced.send_replace(true) {
            info!(objects = self.store.len(), version = %resource_version, "Cache synced");
        }

        let mut stream = self.source.watch(&resource_version).await?;
        let mut resync = self.resync_interval();

        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
                () = tick(resync.as_mut()) => self.resync(),
            }
        }
    }

    fn resync_interval(&self) -> Option<Interval> {
        if self.config.resync_period.is_zero() {
            return None;
        }
        let start = Instant::now().checked_add(self.config.resync_period)?;
        let mut interval = tokio::time::interval_at(start, self.config.resync_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    }

    fn emit(&self, notification: Notification<K>) {
        if self.tx.send(notification).is_err() {
            trace!("Notification receiver dropped");
        }
    }

    /// Swap in a full listing and emit the difference against the old state.
    fn replace(&self, items: Vec<K>) {
        let mut fresh: HashMap<ObjectKey, Arc<K>> = HashMap::with_capacity(items.len());
        for item in items {
            if let Some(key) = item.key().into_option_logged("Skipping listed object with malformed key") {
                fresh.insert(key, Arc::new(item));
            }
        }

        let mut previous = self.store.replace(fresh.clone());
        let mut changes = 0usize;

        for (key, new) in fresh {
            match previous.remove(&key) {
                None => {
                    changes = changes.saturating_add(1);
                    self.emit(Notification::Added(new));
                }
                Some(old) if old.meta().resource_version != new.meta().resource_version => {
                    changes = changes.saturating_add(1);
                    self.emit(Notification::Updated { old, new });
                }
                Some(_) => {}
            }
        }

        for (_, object) in previous {
            changes = changes.saturating_add(1);
            self.emit(Notification::Deleted {
                object,
                final_state_unknown: true,
            });
        }

        debug!(objects = self.store.len(), changes, "Applied listing");
    }

    fn apply(&self, event: WatchEvent<K>) {
        let Some(key) = event
            .object()
            .key()
            .into_option_logged("Skipping watch event with malformed key")
        else {
            return;
        };

        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                let new = Arc::new(object);
                match self.store.upsert(key.clone(), Arc::clone(&new)) {
                    None => self.emit(Notification::Added(new)),
                    Some(old) if old.meta().resource_version == new.meta().resource_version => {
                        trace!(key = %key, "Stale watch event ignored");
                    }
                    Some(old) => self.emit(Notification::Updated { old, new }),
                }
            }
            WatchEvent::Deleted(object) => {
                let object = self.store.remove(&key).unwrap_or_else(|| Arc::new(object));
                self.emit(Notification::Deleted {
                    object,
                    final_state_unknown: false,
                });
            }
        }
    }

    /// Re-deliver every cached object as an update.
    fn resync(&self) {
        let objects = self.store.list();
        debug!(objects = objects.len(), "Resync");
        for object in objects {
            self.emit(Notification::Updated {
                old: Arc::clone(&object),
                new: object,
            });
        }
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
