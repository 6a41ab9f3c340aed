//! The business-logic seam.

use std::sync::Arc;

use async_trait::async_trait;
use converge_core::{ObjectKey, Resource, Result};

/// What a reconcile pass does once it knows whether the resource exists.
///
/// Both methods must be idempotent: a key can be reconciled any number of
/// times, including after a crash halfway through a previous pass.
///
/// Return [`converge_core::Error::PermanentSync`] for failures that retrying
/// cannot fix; any other error is retried with backoff.
#[async_trait]
pub trait SyncHandler<K: Resource>: Send + Sync {
    /// Drive the world toward `object`, the latest cached snapshot of `key`.
    async fn sync(&self, key: &ObjectKey, object: Arc<K>) -> Result<()>;

    /// The resource is gone; release whatever was derived from it.
    async fn cleanup(&self, key: &ObjectKey) -> Result<()>;
}
