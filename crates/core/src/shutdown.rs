//! Shutdown signalling for the control loop.
//!
//! A single [`ShutdownCoordinator`] owns the signal; every long-running task
//! (informer, translator, workers) holds a cloned [`ShutdownSignal`] and
//! observes it without needing new work to arrive first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info};

/// Why shutdown was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownReason {
    /// SIGTERM signal received
    Sigterm,
    /// SIGINT signal received (Ctrl+C)
    Sigint,
    /// Programmatic shutdown requested
    Programmatic,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sigterm => write!(f, "SIGTERM"),
            Self::Sigint => write!(f, "SIGINT"),
            Self::Programmatic => write!(f, "PROGRAMMATIC"),
        }
    }
}

/// Shutdown coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownPhase {
    /// Normal operation, no shutdown initiated
    Running,
    /// Signal broadcast, tasks are stopping
    Initiating,
    /// Waiting for in-flight reconciles to finish
    Draining,
    /// Cleanup complete
    Complete,
}

/// Receiving half of the shutdown broadcast. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<Option<ShutdownReason>>,
}

impl ShutdownSignal {
    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolve once shutdown is requested.
    ///
    /// A dropped coordinator counts as a shutdown request.
    pub async fn triggered(&self) -> Option<ShutdownReason> {
        let mut rx = self.rx.clone();
        let reason = rx.wait_for(Option::is_some).await.map(|r| *r);
        reason.unwrap_or(Some(ShutdownReason::Programmatic))
    }
}

/// Owner of the shutdown broadcast.
pub struct ShutdownCoordinator {
    /// Current shutdown phase
    phase: RwLock<ShutdownPhase>,
    /// Whether shutdown has been initiated
    initiated: AtomicBool,
    /// Broadcast of the shutdown reason
    tx: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            phase: RwLock::new(ShutdownPhase::Running),
            initiated: AtomicBool::new(false),
            tx,
        }
    }

    /// Get a handle that observes the shutdown broadcast.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Check if shutdown has been initiated
    #[must_use]
    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::Acquire)
    }

    /// Get the current shutdown phase
    pub async fn phase(&self) -> ShutdownPhase {
        *self.phase.read().await
    }

    /// Move to a later phase.
    pub async fn set_phase(&self, phase: ShutdownPhase) {
        debug!(?phase, "Shutdown phase changed");
        *self.phase.write().await = phase;
    }

    /// Broadcast the shutdown request.
    ///
    /// Returns `false` when shutdown was already in progress.
    pub async fn initiate(&self, reason: ShutdownReason) -> bool {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Shutdown already in progress, ignoring duplicate signal");
            return false;
        }

        info!(
            reason = %reason,
            subscribers = self.tx.receiver_count(),
            "Initiating graceful shutdown"
        );
        *self.phase.write().await = ShutdownPhase::Initiating;
        self.tx.send_replace(Some(reason));
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Install OS signal handlers (SIGTERM, SIGINT) that initiate shutdown.
pub fn install_signal_handlers(
    coordinator: Arc<ShutdownCoordinator>,
) -> tokio::task::JoinHandle<()> {
    info!("Installing OS signal handlers");

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };

            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGINT handler");
                    return;
                }
            };

            let reason = tokio::select! {
                _ = sigterm.recv() => ShutdownReason::Sigterm,
                _ = sigint.recv() => ShutdownReason::Sigint,
            };
            info!(reason = %reason, "Received signal");
            coordinator.initiate(reason).await;
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }

            info!("Received Ctrl+C");
            coordinator.initiate(ShutdownReason::Sigint).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_coordinator_creation() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.phase().await, ShutdownPhase::Running);
        assert!(!coordinator.is_initiated());
        assert!(!coordinator.signal().is_triggered());
    }

    #[tokio::test]
    async fn test_initiate_broadcasts_to_every_signal() {
        let coordinator = ShutdownCoordinator::new();
        let first = coordinator.signal();
        let second = first.clone();

        assert!(coordinator.initiate(ShutdownReason::Programmatic).await);

        assert!(first.is_triggered());
        assert!(second.is_triggered());
        assert_eq!(coordinator.phase().await, ShutdownPhase::Initiating);
        let reason = tokio::time::timeout(Duration::from_secs(1), second.triggered()).await;
        assert_eq!(reason.ok().flatten(), Some(ShutdownReason::Programmatic));
    }

    #[tokio::test]
    async fn test_duplicate_shutdown_ignored() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.initiate(ShutdownReason::Sigint).await);
        assert!(!coordinator.initiate(ShutdownReason::Sigterm).await);

        let reason = coordinator.signal().triggered().await;
        assert_eq!(reason, Some(ShutdownReason::Sigint));
    }

    #[tokio::test]
    async fn test_waiters_wake_on_initiate() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let signal = coordinator.signal();
        let waiter = tokio::spawn(async move { signal.triggered().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.initiate(ShutdownReason::Programmatic).await;

        let joined = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(joined, Ok(Ok(Some(ShutdownReason::Programmatic)))));
    }

    #[tokio::test]
    async fn test_dropped_coordinator_counts_as_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();
        drop(coordinator);

        let reason = tokio::time::timeout(Duration::from_secs(1), signal.triggered()).await;
        assert!(reason.is_ok());
    }
}
