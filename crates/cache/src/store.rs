//! Local object store backing the informer.
//!
//! The informer is the only writer. Every other component holds a cloned
//! [`Store`] and reads through [`Store::get`] and friends, which never block on
//! the network.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use converge_core::{ObjectKey, Resource, ResultExt};

/// Read handle to the cached snapshots. Cheap to clone.
pub struct Store<K> {
    objects: Arc<RwLock<HashMap<ObjectKey, Arc<K>>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
        }
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K> Store<K> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ObjectKey, Arc<K>>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ObjectKey, Arc<K>>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last observed snapshot for `key`.
    #[must_use]
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().get(key).cloned()
    }

    /// Whether `key` is cached.
    #[must_use]
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.read().contains_key(key)
    }

    /// All cached snapshots, in no particular order.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<K>> {
        self.read().values().cloned().collect()
    }

    /// All cached keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of cached objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub(crate) fn upsert(&self, key: ObjectKey, object: Arc<K>) -> Option<Arc<K>> {
        self.write().insert(key, object)
    }

    pub(crate) fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.write().remove(key)
    }

    /// Swap in a complete listing, returning the previous contents.
    pub(crate) fn replace(&self, objects: HashMap<ObjectKey, Arc<K>>) -> HashMap<ObjectKey, Arc<K>> {
        std::mem::replace(&mut *self.write(), objects)
    }
}

/// Build a pre-populated store, e.g. for a reconciler that is driven by hand.
impl<K: Resource> FromIterator<K> for Store<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let mut objects = HashMap::new();
        for object in iter {
            if let Some(key) = object.key().into_option_logged("Skipping object with malformed key") {
                objects.insert(key, Arc::new(object));
            }
        }
        Self {
            objects: Arc::new(RwLock::new(objects)),
        }
    }
}
