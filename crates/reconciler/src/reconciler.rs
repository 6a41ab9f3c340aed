//! Reconciler implementation.

use std::sync::Arc;

use converge_cache::Store;
use converge_core::{ObjectKey, Resource};
use tracing::{debug, trace, warn};

use crate::handler::SyncHandler;
use crate::types::{ReconcilePath, ReconcileState, Reconciliation, SyncOutcome};

/// Level-triggered reconciler.
///
/// A pass never looks at the notification that caused it. It re-reads the
/// cache and decides from current state alone whether the resource needs a
/// sync or a cleanup, so duplicate, reordered and dropped notifications all
/// converge to the same result.
pub struct Reconciler<K> {
    store: Store<K>,
    handler: Arc<dyn SyncHandler<K>>,
}

impl<K: Resource> Reconciler<K> {
    /// Create a reconciler reading from `store`.
    pub fn new(store: Store<K>, handler: Arc<dyn SyncHandler<K>>) -> Self {
        Self { store, handler }
    }

    /// Run one pass for `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Reconciliation {
        transition(key, ReconcileState::Resolving);
        if let Err(e) = key.validate() {
            warn!(key = %key, error = %e, "Dropping malformed key");
            return finish(key, ReconcilePath::Invalid, SyncOutcome::TerminalError(e));
        }

        transition(key, ReconcileState::CheckingExistence);
        match self.store.get(key) {
            None => {
                transition(key, ReconcileState::HandlingDelete);
                let result = self.handler.cleanup(key).await;
                finish(key, ReconcilePath::Delete, SyncOutcome::from_result(result))
            }
            Some(object) => {
                transition(key, ReconcileState::Syncing);
                let result = self.handler.sync(key, object).await;
                finish(key, ReconcilePath::Sync, SyncOutcome::from_result(result))
            }
        }
    }
}

fn transition(key: &ObjectKey, state: ReconcileState) {
    trace!(key = %key, state = %state, "Reconcile transition");
}

fn finish(key: &ObjectKey, path: ReconcilePath, outcome: SyncOutcome) -> Reconciliation {
    let state = outcome.state();
    match outcome.error() {
        None => debug!(key = %key, path = %path, state = %state, "Reconcile finished"),
        Some(e) => debug!(key = %key, path = %path, state = %state, error = %e, "Reconcile failed"),
    }
    Reconciliation::new(path, outcome)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use converge_core::{Error, ObjectMeta, Result};

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

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<String>>,
        fail_with: Option<Error>,
    }

    impl RecordingHandler {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        fn record(&self, call: String) -> Result<()> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
            self.fail_with.clone().map_or(Ok(()), Err)
        }
    }

    #[async_trait]
    impl SyncHandler<Widget> for RecordingHandler {
        async fn sync(&self, key: &ObjectKey, _object: Arc<Widget>) -> Result<()> {
            self.record(format!("sync {key}"))
        }

        async fn cleanup(&self, key: &ObjectKey) -> Result<()> {
            self.record(format!("cleanup {key}"))
        }
    }

    fn cached(names: &[&str]) -> Store<Widget> {
        names
            .iter()
            .map(|name| Widget {
                meta: ObjectMeta::namespaced("default", *name),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_present_resource_is_synced() {
        let handler = Arc::new(RecordingHandler::default());
        let reconciler = Reconciler::new(cached(&["foo"]), handler.clone());

        let result = reconciler.reconcile(&ObjectKey::namespaced("default", "foo")).await;

        assert_eq!(result.path, ReconcilePath::Sync);
        assert!(result.outcome.is_done());
        assert_eq!(handler.calls(), vec!["sync default/foo".to_string()]);
    }

    #[tokio::test]
    async fn test_absent_resource_is_cleaned_up() {
        let handler = Arc::new(RecordingHandler::default());
        let reconciler = Reconciler::new(cached(&[]), handler.clone());

        let result = reconciler.reconcile(&ObjectKey::namespaced("default", "gone")).await;

        assert_eq!(result.path, ReconcilePath::Delete);
        assert!(result.outcome.is_done());
        assert_eq!(handler.calls(), vec!["cleanup default/gone".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_key_is_terminal_without_handler_call() {
        let handler = Arc::new(RecordingHandler::default());
        let reconciler = Reconciler::new(cached(&[]), handler.clone());

        let result = reconciler.reconcile(&ObjectKey::namespaced("", "foo")).await;

        assert_eq!(result.path, ReconcilePath::Invalid);
        assert!(matches!(
            result.outcome,
            SyncOutcome::TerminalError(Error::KeyResolution { .. })
        ));
        assert!(handler.calls().is_empty());
    }

    #[tokio::test]
    async fn test_handler_errors_are_classified() {
        let transient = Arc::new(RecordingHandler {
            fail_with: Some(Error::transient_sync("default/foo", "conflict")),
            ..RecordingHandler::default()
        });
        let reconciler = Reconciler::new(cached(&["foo"]), transient);
        let result = reconciler.reconcile(&ObjectKey::namespaced("default", "foo")).await;
        assert!(result.outcome.is_retryable());

        let permanent = Arc::new(RecordingHandler {
            fail_with: Some(Error::permanent_sync("default/foo", "invalid selector")),
            ..RecordingHandler::default()
        });
        let reconciler = Reconciler::new(cached(&["foo"]), permanent);
        let result = reconciler.reconcile(&ObjectKey::namespaced("default", "foo")).await;
        assert!(matches!(result.outcome, SyncOutcome::TerminalError(_)));
    }

    #[tokio::test]
    async fn test_repeated_passes_are_independent() {
        let handler = Arc::new(RecordingHandler::default());
        let reconciler = Reconciler::new(cached(&["foo"]), handler.clone());
        let key = ObjectKey::namespaced("default", "foo");

        for _ in 0..3 {
            assert!(reconciler.reconcile(&key).await.outcome.is_done());
        }
        assert_eq!(handler.calls().len(), 3);
    }
}
