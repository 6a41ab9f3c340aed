//! Identity keys and resource metadata.
//!
//! An [`ObjectKey`] is the only value that flows through the work queue. It
//! is derived from a resource's [`ObjectMeta`] once, when a notification is
//! translated, and stays the same for the lifetime of the resource.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// Stable identity of one managed resource: `namespace/name` or `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    /// Create a key for a namespaced resource.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Create a key for a cluster-scoped resource.
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Parse the canonical string form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyResolution`] when the string has more than one `/`
    /// or an empty segment.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split('/');
        let key = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Self::cluster_scoped(name),
            (Some(namespace), Some(name), None) => Self::namespaced(namespace, name),
            _ => return Err(Error::key_resolution(raw, "unexpected key format")),
        };
        key.validate()?;
        Ok(key)
    }

    /// Derive the key for a resource from its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyResolution`] when the metadata has no usable name.
    pub fn from_meta(meta: &ObjectMeta) -> Result<Self> {
        let key = Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
        };
        key.validate()?;
        Ok(key)
    }

    /// Check that both segments are non-empty and contain no separator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyResolution`] describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::key_resolution(self.to_string(), "empty name"));
        }
        if self.name.contains('/') {
            return Err(Error::key_resolution(self.to_string(), "name contains '/'"));
        }
        match self.namespace.as_deref() {
            Some("") => Err(Error::key_resolution(self.to_string(), "empty namespace")),
            Some(ns) if ns.contains('/') => Err(Error::key_resolution(
                self.to_string(),
                "namespace contains '/'",
            )),
            _ => Ok(()),
        }
    }

    /// Namespace, or `None` for cluster-scoped resources.
    #[inline]
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Resource name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Metadata every managed resource carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Namespace, absent for cluster-scoped resources.
    pub namespace: Option<String>,
    /// Name, unique within the namespace.
    pub name: String,
    /// Opaque version assigned by the remote source on every write.
    pub resource_version: String,
}

impl ObjectMeta {
    /// Metadata for a namespaced resource.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
            resource_version: String::new(),
        }
    }

    /// Metadata for a cluster-scoped resource.
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
            resource_version: String::new(),
        }
    }

    /// Set the resource version.
    #[must_use]
    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = version.into();
        self
    }
}

/// A resource the control loop can cache and reconcile.
pub trait Resource: Send + Sync + 'static {
    /// Metadata of this resource.
    fn meta(&self) -> &ObjectMeta;

    /// Mutable metadata, used by sources that stamp resource versions.
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Identity key of this resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyResolution`] when the metadata is malformed.
    fn key(&self) -> Result<ObjectKey> {
        ObjectKey::from_meta(self.meta())
    }
}
