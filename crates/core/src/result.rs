//! Result type definition and logging extensions.

use crate::error::Error;

/// The standard Result type for converge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing logged conversions for Results.
///
/// Used at the edges of the control loop where a failure is reported and
/// then dropped instead of propagated.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error at warn level.
    fn into_option_logged(self, context: &str) -> Option<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn into_option_logged(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "{context}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_into_option_ok() {
        let result: Result<i32> = Ok(42);
        assert_eq!(result.into_option_logged("test"), Some(42));
    }

    #[test]
    fn test_result_into_option_err() {
        let result: Result<i32> = Err(Error::ChannelClosed);
        assert_eq!(result.into_option_logged("test"), None);
    }
}
