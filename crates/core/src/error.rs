//! Core error types for the control loop.
//!
//! Every reconcile-time failure is an explicit, typed value. The worker pool
//! turns these into a retry/drop decision via [`Error::is_retryable`]; nothing
//! in the loop panics the process on an individual failure.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Core error type for converge operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Key errors
    #[error("cannot resolve key '{key}': {reason}")]
    KeyResolution { key: String, reason: String },

    // Sync errors
    #[error("transient sync failure for '{key}': {reason}")]
    TransientSync { key: String, reason: String },

    #[error("permanent sync failure for '{key}': {reason}")]
    PermanentSync { key: String, reason: String },

    #[error("reconcile of '{key}' panicked: {message}")]
    WorkerPanicked { key: String, message: String },

    // Cache errors
    #[error("cache did not sync within {waited:?}")]
    CacheSyncTimeout { waited: Duration },

    #[error("watch failed: {reason}")]
    Watch { reason: String },

    #[error("channel closed")]
    ChannelClosed,

    // Configuration errors
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("failed to parse config '{path}': {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Create a key resolution error.
    pub fn key_resolution(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::KeyResolution {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a transient (retryable) sync error.
    pub fn transient_sync(key: impl ToString, reason: impl Into<String>) -> Self {
        Self::TransientSync {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a permanent (terminal) sync error.
    pub fn permanent_sync(key: impl ToString, reason: impl Into<String>) -> Self {
        Self::PermanentSync {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a worker panic error.
    pub fn worker_panicked(key: impl ToString, message: impl Into<String>) -> Self {
        Self::WorkerPanicked {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Create a watch error.
    pub fn watch(reason: impl Into<String>) -> Self {
        Self::Watch {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a config parse error.
    pub fn config_parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ConfigParse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether a reconcile that failed with this error should be requeued.
    ///
    /// Only errors explicitly known to be permanent are terminal; anything
    /// unexpected is retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::KeyResolution { .. } | Self::PermanentSync { .. } | Self::InvalidConfig { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::transient_sync("default/foo", "connection reset");
        assert!(err.to_string().contains("default/foo"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_classification() {
        assert!(Error::transient_sync("a", "x").is_retryable());
        assert!(Error::worker_panicked("a", "boom").is_retryable());
        assert!(Error::watch("gone").is_retryable());
        assert!(!Error::permanent_sync("a", "bad selector").is_retryable());
        assert!(!Error::key_resolution("a/b/c", "too many segments").is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(ref msg) if msg.contains("missing")));
    }
}
