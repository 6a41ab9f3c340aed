//! Core types for the reconciler.

use std::fmt;
use std::time::Duration;

use converge_core::{Error, ObjectKey};
use serde::{Deserialize, Serialize};

/// Result of one reconcile pass for one key.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// Converged. Retry history is forgotten.
    Done,
    /// Failed in a way that may succeed later. The key is requeued with backoff.
    RetryableError(Error),
    /// Failed permanently. The key is dropped and the failure only reported.
    TerminalError(Error),
}

impl SyncOutcome {
    /// Classify a handler result.
    #[must_use]
    pub fn from_result(result: converge_core::Result<()>) -> Self {
        match result {
            Ok(()) => Self::Done,
            Err(e) if e.is_retryable() => Self::RetryableError(e),
            Err(e) => Self::TerminalError(e),
        }
    }

    /// Whether the pass converged.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Whether the key will be requeued.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableError(_))
    }

    /// The error, if the pass failed.
    #[must_use]
    pub const fn error(&self) -> Option<&Error> {
        match self {
            Self::Done => None,
            Self::RetryableError(e) | Self::TerminalError(e) => Some(e),
        }
    }

    /// Terminal state this outcome corresponds to.
    #[must_use]
    pub const fn state(&self) -> ReconcileState {
        match self {
            Self::Done => ReconcileState::Done,
            Self::RetryableError(_) => ReconcileState::RetryableError,
            Self::TerminalError(_) => ReconcileState::TerminalError,
        }
    }
}

/// States of a single reconcile pass.
///
/// ```text
/// Resolving -> CheckingExistence -> HandlingDelete | Syncing
///           -> Done | RetryableError | TerminalError
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    Resolving,
    CheckingExistence,
    HandlingDelete,
    Syncing,
    Done,
    RetryableError,
    TerminalError,
}

impl ReconcileState {
    /// Whether the pass ends in this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::RetryableError | Self::TerminalError)
    }
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Resolving => "resolving",
            Self::CheckingExistence => "checking_existence",
            Self::HandlingDelete => "handling_delete",
            Self::Syncing => "syncing",
            Self::Done => "done",
            Self::RetryableError => "retryable_error",
            Self::TerminalError => "terminal_error",
        };
        f.write_str(s)
    }
}

/// Which branch a pass took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePath {
    /// The key failed validation.
    Invalid,
    /// The resource was absent from the cache; cleanup ran.
    Delete,
    /// The resource was present; sync ran.
    Sync,
    /// The pass panicked before reaching an outcome.
    Aborted,
}

impl fmt::Display for ReconcilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Invalid => "invalid",
            Self::Delete => "delete",
            Self::Sync => "sync",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Branch and outcome of one pass, as returned by the reconciler.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub path: ReconcilePath,
    pub outcome: SyncOutcome,
}

impl Reconciliation {
    #[must_use]
    pub const fn new(path: ReconcilePath, outcome: SyncOutcome) -> Self {
        Self { path, outcome }
    }
}

/// What a worker did with a key, published on the controller's report stream.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub key: ObjectKey,
    pub worker: usize,
    pub path: ReconcilePath,
    pub outcome: SyncOutcome,
    /// Consecutive failures recorded for the key after this pass.
    pub requeues: u32,
    /// Delay before the key is retried, for retryable outcomes.
    pub requeue_delay: Option<Duration>,
    /// Set once `requeues` reaches the standing-condition threshold.
    pub standing_condition: bool,
    pub duration: Duration,
}

impl ReconcileReport {
    /// Whether the pass converged.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.outcome.is_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        assert!(SyncOutcome::from_result(Ok(())).is_done());
        assert!(SyncOutcome::from_result(Err(Error::transient_sync("a", "busy"))).is_retryable());
        assert!(matches!(
            SyncOutcome::from_result(Err(Error::permanent_sync("a", "bad selector"))),
            SyncOutcome::TerminalError(_)
        ));
        assert!(matches!(
            SyncOutcome::from_result(Err(Error::key_resolution("a/b/c", "too many segments"))),
            SyncOutcome::TerminalError(_)
        ));
    }

    #[test]
    fn test_outcome_state_is_terminal() {
        let outcomes = [
            SyncOutcome::Done,
            SyncOutcome::RetryableError(Error::ChannelClosed),
            SyncOutcome::TerminalError(Error::permanent_sync("a", "x")),
        ];
        assert!(outcomes.iter().all(|o| o.state().is_terminal()));
        assert!(!ReconcileState::Syncing.is_terminal());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&ReconcileState::CheckingExistence).ok();
        assert_eq!(json.as_deref(), Some("\"checking_existence\""));
        assert_eq!(ReconcileState::HandlingDelete.to_string(), "handling_delete");
    }

    #[test]
    fn test_error_accessor() {
        assert!(SyncOutcome::Done.error().is_none());
        let outcome = SyncOutcome::RetryableError(Error::transient_sync("k", "timeout"));
        assert!(outcome.error().is_some_and(|e| e.to_string().contains("timeout")));
    }
}
