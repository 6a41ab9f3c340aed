//! Remote resource API seam.
//!
//! [`ListWatch`] is what the informer consumes: a full listing stamped with a
//! resource version, and a stream of deltas after that version. Transport and
//! auth live behind the trait. [`InMemorySource`] implements it for tests and
//! the demo binary.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use converge_core::{Error, ObjectKey, Resource, Result};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// A change observed on the watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    /// The object carried by this event.
    pub const fn object(&self) -> &K {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => obj,
        }
    }
}

/// A complete listing of the collection.
#[derive(Debug, Clone)]
pub struct ListResult<K> {
    pub items: Vec<K>,
    /// Version to resume watching from.
    pub resource_version: String,
}

/// Subscribe/list interface of the remote collection.
#[async_trait]
pub trait ListWatch<K: Resource>: Send + Sync {
    /// List every object.
    async fn list(&self) -> Result<ListResult<K>>;

    /// Stream changes made after `resource_version`.
    ///
    /// The stream ends or yields an error when the server drops the watch;
    /// the informer then relists.
    async fn watch(&self, resource_version: &str) -> Result<BoxStream<'static, Result<WatchEvent<K>>>>;
}

const HISTORY_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
enum Signal<K> {
    Event(u64, WatchEvent<K>),
    Break,
}

struct Inner<K> {
    objects: BTreeMap<ObjectKey, K>,
    history: VecDeque<(u64, WatchEvent<K>)>,
    version: u64,
}

/// In-process collection with a versioned change log.
///
/// Every write bumps a global version, stamps it on the object, and appends
/// it to a bounded history so a watch can resume from any recent version.
pub struct InMemorySource<K> {
    inner: Mutex<Inner<K>>,
    tx: broadcast::Sender<Signal<K>>,
    failing_lists: AtomicU32,
}

impl<K> InMemorySource<K>
where
    K: Resource + Clone,
{
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HISTORY_LIMIT);
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                history: VecDeque::new(),
                version: 0,
            }),
            tx,
            failing_lists: AtomicU32::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, inner: &mut Inner<K>, event: WatchEvent<K>) {
        inner.history.push_back((inner.version, event.clone()));
        while inner.history.len() > HISTORY_LIMIT {
            inner.history.pop_front();
        }
        // No receivers just means nobody is watching yet.
        let _ = self.tx.send(Signal::Event(inner.version, event));
    }

    /// Create or replace an object, returning it with its new version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyResolution`] if the object's metadata is malformed.
    pub fn upsert(&self, mut object: K) -> Result<K> {
        let key = object.key()?;
        let mut inner = self.lock();
        inner.version = inner.version.saturating_add(1);
        object.meta_mut().resource_version = inner.version.to_string();

        let existed = inner.objects.insert(key.clone(), object.clone()).is_some();
        let event = if existed {
            WatchEvent::Modified(object.clone())
        } else {
            WatchEvent::Added(object.clone())
        };
        trace!(key = %key, version = inner.version, existed, "Source write");
        self.record(&mut inner, event);
        Ok(object)
    }

    /// Delete an object, returning its last state if it existed.
    pub fn delete(&self, key: &ObjectKey) -> Option<K> {
        let mut inner = self.lock();
        let mut removed = inner.objects.remove(key)?;
        inner.version = inner.version.saturating_add(1);
        removed.meta_mut().resource_version = inner.version.to_string();
        trace!(key = %key, version = inner.version, "Source delete");
        self.record(&mut inner, WatchEvent::Deleted(removed.clone()));
        Some(removed)
    }

    /// Current state of an object.
    #[must_use]
    pub fn get(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).cloned()
    }

    /// Number of objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    /// All keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Terminate every open watch with an error, forcing watchers to relist.
    pub fn break_watches(&self) {
        debug!("Breaking open watches");
        let _ = self.tx.send(Signal::Break);
    }

    /// Make the next `count` list calls fail.
    pub fn fail_next_lists(&self, count: u32) {
        self.failing_lists.store(count, Ordering::SeqCst);
    }

    fn take_list_failure(&self) -> bool {
        self.failing_lists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<K> Default for InMemorySource<K>
where
    K: Resource + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K> ListWatch<K> for InMemorySource<K>
where
    K: Resource + Clone,
{
    async fn list(&self) -> Result<ListResult<K>> {
        if self.take_list_failure() {
            return Err(Error::watch("list failed (injected)"));
        }
        let inner = self.lock();
        Ok(ListResult {
            items: inner.objects.values().cloned().collect(),
            resource_version: inner.version.to_string(),
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        let since: u64 = resource_version
            .parse()
            .map_err(|_| Error::watch(format!("invalid resource version '{resource_version}'")))?;

        let inner = self.lock();
        let oldest = inner.history.front().map_or(inner.version, |(v, _)| v.saturating_sub(1));
        if since < oldest {
            return Err(Error::watch(format!(
                "resource version {since} too old, oldest is {oldest}"
            )));
        }

        let backlog: Vec<Result<WatchEvent<K>>> = inner
            .history
            .iter()
            .filter(|(v, _)| *v > since)
            .map(|(_, event)| Ok(event.clone()))
            .collect();
        let last_seen = inner.version;
        // Subscribing under the lock means no write slips between backlog and live feed.
        let rx = self.tx.subscribe();
        drop(inner);

        let live = stream::unfold((rx, false), move |(mut rx, done)| async move {
            if done {
                return None;
            }
            loop {
                match rx.recv().await {
                    Ok(Signal::Event(version, _)) if version <= last_seen => {}
                    Ok(Signal::Event(_, event)) => return Some((Ok(event), (rx, false))),
                    Ok(Signal::Break) => {
                        return Some((Err(Error::watch("watch closed by server")), (rx, true)));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        return Some((
                            Err(Error::watch(format!("watch lagged by {skipped} events"))),
                            (rx, true),
                        ));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::iter(backlog).chain(live).boxed())
    }
}
