//! # Resource Cache
//!
//! Local, eventually consistent view of a remote resource collection.
//!
//! An [`Informer`] lists the collection, watches for deltas, writes them to a
//! [`Store`] and then emits a [`Notification`]. Readers query the store
//! without touching the network.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod informer;
pub mod source;
pub mod store;

pub use informer::{Informer, InformerConfig, Notification, NotificationStream};
pub use source::{InMemorySource, ListResult, ListWatch, WatchEvent};
pub use store::Store;
