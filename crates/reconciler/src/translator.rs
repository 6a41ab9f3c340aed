//! Turns cache notifications into queue keys.

use std::marker::PhantomData;

use converge_cache::{Notification, NotificationStream};
use converge_core::{ObjectKey, Resource, ResultExt, ShutdownSignal};
use converge_workqueue::WorkQueue;
use tracing::{debug, info, trace};

/// Extracts identity keys from notifications and enqueues them.
///
/// Add, update and delete all enqueue the same key. What happened is
/// re-derived from the cache when the key is reconciled, so the translator
/// carries no state and never blocks.
pub struct EventTranslator<K> {
    queue: WorkQueue<ObjectKey>,
    _resource: PhantomData<fn(K)>,
}

impl<K: Resource> EventTranslator<K> {
    /// Translate notifications into keys on `queue`.
    #[must_use]
    pub fn new(queue: WorkQueue<ObjectKey>) -> Self {
        Self {
            queue,
            _resource: PhantomData,
        }
    }

    /// A new object appeared in the cache.
    pub fn on_add(&self, object: &K) {
        self.enqueue(object, "add");
    }

    /// An object changed. Only the new version's key is enqueued.
    pub fn on_update(&self, _old: &K, new: &K) {
        self.enqueue(new, "update");
    }

    /// An object left the cache. `final_state_unknown` marks deletes found by
    /// a relist rather than observed on the watch.
    pub fn on_delete(&self, object: &K, final_state_unknown: bool) {
        if final_state_unknown {
            debug!(name = %object.meta().name, "Delete inferred from relist");
        }
        self.enqueue(object, "delete");
    }

    /// Dispatch one notification.
    pub fn handle(&self, notification: &Notification<K>) {
        match notification {
            Notification::Added(object) => self.on_add(object),
            Notification::Updated { old, new } => self.on_update(old, new),
            Notification::Deleted {
                object,
                final_state_unknown,
            } => self.on_delete(object, *final_state_unknown),
        }
    }

    /// Consume the informer's notifications until shutdown or until the
    /// informer goes away.
    pub async fn run(&self, mut notifications: NotificationStream<K>, shutdown: ShutdownSignal) {
        info!(queue = self.queue.name(), "Starting event translator");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                next = notifications.recv() => match next {
                    Some(notification) => self.handle(&notification),
                    None => {
                        debug!("Notification stream closed");
                        break;
                    }
                },
            }
        }
        info!("Event translator stopped");
    }

    fn enqueue(&self, object: &K, kind: &'static str) {
        if let Some(key) = object
            .key()
            .into_option_logged("Dropping notification with unresolvable key")
        {
            trace!(key = %key, kind, "Enqueue");
            self.queue.add(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use converge_cache::{InMemorySource, Informer, InformerConfig};
    use converge_core::{ObjectMeta, ShutdownCoordinator, ShutdownReason};

    use super::*;

    #[derive(Debug, Clone)]
    struct Widget {
        meta: ObjectMeta,
    }

    impl Resource for Widget {
        fn meta(&self) -> &ObjectMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut ObjectMeta {
            &mut self.meta
        }
    }

    fn widget(namespace: &str, name: &str) -> Arc<Widget> {
        Arc::new(Widget {
            meta: ObjectMeta::namespaced(namespace, name),
        })
    }

    #[tokio::test]
    async fn test_all_notification_kinds_enqueue_the_same_key() {
        let queue = WorkQueue::new("test");
        let translator = EventTranslator::new(queue.clone());
        let foo = widget("default", "foo");

        translator.handle(&Notification::Added(Arc::clone(&foo)));
        translator.handle(&Notification::Updated {
            old: Arc::clone(&foo),
            new: Arc::clone(&foo),
        });
        translator.handle(&Notification::Deleted {
            object: foo,
            final_state_unknown: false,
        });

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(ObjectKey::namespaced("default", "foo")));
    }

    #[test]
    fn test_unresolvable_key_is_dropped() {
        let queue = WorkQueue::new("test");
        let translator = EventTranslator::<Widget>::new(queue.clone());

        translator.on_add(&widget("default", ""));
        translator.on_delete(&widget("", "foo"), true);

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_stream_until_shutdown() {
        let queue = WorkQueue::new("test");
        let translator = EventTranslator::new(queue.clone());
        let source = Arc::new(InMemorySource::new());
        let _ = source.upsert(Widget {
            meta: ObjectMeta::namespaced("default", "foo"),
        });
        let (informer, stream) = Informer::new(source, InformerConfig::default());
        let coordinator = ShutdownCoordinator::new();

        let signal = coordinator.signal();
        let informer_signal = coordinator.signal();
        let run = async {
            tokio::join!(informer.run(informer_signal), translator.run(stream, signal));
        };
        let stop = async {
            while queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            coordinator.initiate(ShutdownReason::Programmatic).await;
        };

        let finished = tokio::time::timeout(Duration::from_secs(2), async { tokio::join!(run, stop) }).await;
        assert!(finished.is_ok());
        assert_eq!(queue.len(), 1);
    }
}
