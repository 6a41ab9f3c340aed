//! Owner → dependent reconciliation.
//!
//! [`DependentReconciler`] keeps one dependent object (a Service for a
//! Deployment, say) in step with its owner. On sync it derives the desired
//! dependent, reads the observed one and applies the smallest change; on
//! cleanup it deletes the dependent if one is still there.

use std::sync::Arc;

use async_trait::async_trait;
use converge_cache::InMemorySource;
use converge_core::{ObjectKey, Resource, Result};
use tracing::{debug, info};

use crate::handler::SyncHandler;

/// Write access to the dependent collection.
#[async_trait]
pub trait DependentApi<D>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<D>>;
    async fn create(&self, object: D) -> Result<()>;
    async fn update(&self, object: D) -> Result<()>;
    /// Deleting an absent object is not an error.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

#[async_trait]
impl<D> DependentApi<D> for InMemorySource<D>
where
    D: Resource + Clone,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<D>> {
        Ok(InMemorySource::get(self, key))
    }

    async fn create(&self, object: D) -> Result<()> {
        self.upsert(object).map(|_| ())
    }

    async fn update(&self, object: D) -> Result<()> {
        self.upsert(object).map(|_| ())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        InMemorySource::delete(self, key);
        Ok(())
    }
}

/// What a pass did to the dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentAction {
    Created,
    Updated,
    Deleted,
    /// Observed state already matched.
    Unchanged,
    /// Cleanup found nothing to delete.
    Absent,
}

type DesiredFn<K, D> = dyn Fn(&ObjectKey, &K) -> Result<D> + Send + Sync;
type KeyFn = dyn Fn(&ObjectKey) -> ObjectKey + Send + Sync;

/// A [`SyncHandler`] maintaining one dependent per owner.
pub struct DependentReconciler<K, D> {
    api: Arc<dyn DependentApi<D>>,
    desired: Box<DesiredFn<K, D>>,
    dependent_key: Box<KeyFn>,
}

impl<K, D> DependentReconciler<K, D>
where
    K: Resource,
    D: Resource + Clone + PartialEq,
{
    /// `desired` derives the dependent from the owner. The dependent shares
    /// the owner's key unless [`Self::with_key_mapping`] says otherwise.
    pub fn new<F>(api: Arc<dyn DependentApi<D>>, desired: F) -> Self
    where
        F: Fn(&ObjectKey, &K) -> Result<D> + Send + Sync + 'static,
    {
        Self {
            api,
            desired: Box::new(desired),
            dependent_key: Box::new(|key: &ObjectKey| key.clone()),
        }
    }

    /// Map an owner key to its dependent's key.
    #[must_use]
    pub fn with_key_mapping<F>(mut self, mapping: F) -> Self
    where
        F: Fn(&ObjectKey) -> ObjectKey + Send + Sync + 'static,
    {
        self.dependent_key = Box::new(mapping);
        self
    }

    /// Converge the dependent of `owner`.
    ///
    /// # Errors
    ///
    /// Propagates errors from the desired-state function and the dependent API.
    pub async fn apply(&self, owner_key: &ObjectKey, owner: &K) -> Result<DependentAction> {
        let desired = (self.desired)(owner_key, owner)?;
        let dependent_key = (self.dependent_key)(owner_key);

        let action = match self.api.get(&dependent_key).await? {
            None => {
                self.api.create(desired).await?;
                DependentAction::Created
            }
            Some(observed) if converged(&observed, &desired) => DependentAction::Unchanged,
            Some(observed) => {
                let mut next = desired;
                next.meta_mut().resource_version = observed.meta().resource_version.clone();
                self.api.update(next).await?;
                DependentAction::Updated
            }
        };

        match action {
            DependentAction::Unchanged => debug!(owner = %owner_key, dependent = %dependent_key, "Dependent up to date"),
            _ => info!(owner = %owner_key, dependent = %dependent_key, action = ?action, "Dependent converged"),
        }
        Ok(action)
    }

    /// Remove the dependent of a deleted owner.
    ///
    /// # Errors
    ///
    /// Propagates errors from the dependent API.
    pub async fn remove(&self, owner_key: &ObjectKey) -> Result<DependentAction> {
        let dependent_key = (self.dependent_key)(owner_key);
        if self.api.get(&dependent_key).await?.is_none() {
            debug!(owner = %owner_key, dependent = %dependent_key, "No dependent to delete");
            return Ok(DependentAction::Absent);
        }
        self.api.delete(&dependent_key).await?;
        info!(owner = %owner_key, dependent = %dependent_key, "Dependent deleted");
        Ok(DependentAction::Deleted)
    }
}

/// Equal apart from the server-assigned version.
fn converged<D: Resource + Clone + PartialEq>(observed: &D, desired: &D) -> bool {
    let mut candidate = desired.clone();
    candidate.meta_mut().resource_version = observed.meta().resource_version.clone();
    candidate == *observed
}

#[async_trait]
impl<K, D> SyncHandler<K> for DependentReconciler<K, D>
where
    K: Resource,
    D: Resource + Clone + PartialEq,
{
    async fn sync(&self, key: &ObjectKey, object: Arc<K>) -> Result<()> {
        self.apply(key, &object).await.map(|_| ())
    }

    async fn cleanup(&self, key: &ObjectKey) -> Result<()> {
        self.remove(key).await.map(|_| ())
    }
}
