//! Shared building blocks for the converge control loop.
//!
//! - [`ObjectKey`]: stable identity of a managed resource
//! - [`Resource`] / [`ObjectMeta`]: what the cache stores
//! - [`Error`] / [`Result`]: the error taxonomy and its retry classification
//! - [`ShutdownCoordinator`] / [`ShutdownSignal`]: the single cancellation broadcast

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod key;
pub mod result;
pub mod shutdown;

pub use error::Error;
pub use key::{ObjectKey, ObjectMeta, Resource};
pub use result::{Result, ResultExt};
pub use shutdown::{
    ShutdownCoordinator, ShutdownPhase, ShutdownReason, ShutdownSignal, install_signal_handlers,
};
