//! Level-triggered reconciliation for cached resources.
//!
//! A [`Controller`] ties the pieces together:
//!
//! - **Cache**: an informer keeps a local [`converge_cache::Store`] current
//! - **Translator**: every notification becomes an identity key on the queue
//! - **Queue**: keys are deduplicated, and failed keys come back with backoff
//! - **Workers**: a fixed pool reconciles keys, one worker per key at a time
//! - **Reconciler**: re-reads the cache and calls [`SyncHandler::sync`] or
//!   [`SyncHandler::cleanup`]
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use converge_cache::InMemorySource;
//! use converge_core::ShutdownCoordinator;
//! use converge_reconciler::{Controller, ControllerConfig, DependentReconciler};
//!
//! #[tokio::main]
//! async fn main() -> converge_core::Result<()> {
//!     let deployments = Arc::new(InMemorySource::<Deployment>::new());
//!     let services = Arc::new(InMemorySource::<Service>::new());
//!     let handler = Arc::new(DependentReconciler::new(services, service_for));
//!
//!     let controller = Controller::new("deployments", deployments, handler, ControllerConfig::default())?;
//!     let coordinator = ShutdownCoordinator::new();
//!     controller.run(coordinator.signal()).await
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod controller;
pub mod dependents;
pub mod handler;
pub mod reconciler;
pub mod translator;
pub mod types;
pub mod worker;

pub use config::{ControllerConfig, RateLimitConfig};
pub use controller::Controller;
pub use converge_core::{Error, Result};
pub use dependents::{DependentAction, DependentApi, DependentReconciler};
pub use handler::SyncHandler;
pub use reconciler::Reconciler;
pub use translator::EventTranslator;
pub use types::{ReconcilePath, ReconcileReport, ReconcileState, Reconciliation, SyncOutcome};
pub use worker::WorkerPool;
