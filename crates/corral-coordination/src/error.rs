//! Error types for coordination primitives.
//!
//! Runtime outcomes such as a timed-out acquisition, a lost lock or an
//! unreachable store are not errors here: primitives report them as `None`
//! or `false` and log them. Only construction with an unusable
//! configuration fails.

use snafu::Snafu;

/// Errors from building a coordination primitive.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// A configuration value is out of range.
    #[snafu(display("invalid {primitive} configuration: {reason}"))]
    InvalidConfig {
        /// Which primitive rejected the configuration.
        primitive: &'static str,
        /// What was wrong.
        reason: String,
    },
}

pub(crate) fn invalid(primitive: &'static str, reason: impl Into<String>) -> CoordinationError {
    CoordinationError::InvalidConfig {
        primitive,
        reason: reason.into(),
    }
}

/// Reject a configured duration above `max_ms`.
pub(crate) fn at_most(
    primitive: &'static str,
    field: &str,
    value: std::time::Duration,
    max_ms: u64,
) -> Result<(), CoordinationError> {
    if value > std::time::Duration::from_millis(max_ms) {
        return Err(invalid(primitive, format!("{field} must be at most {max_ms}ms")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display() {
        let err = invalid("semaphore", "capacity must be non-zero");
        assert_eq!(err.to_string(), "invalid semaphore configuration: capacity must be non-zero");
    }

    #[test]
    fn test_at_most() {
        use std::time::Duration;
        assert!(at_most("cache", "lock_ttl", Duration::from_millis(10), 10).is_ok());
        let err = at_most("cache", "lock_ttl", Duration::from_millis(11), 10).unwrap_err();
        assert_eq!(err.to_string(), "invalid cache configuration: lock_ttl must be at most 10ms");
    }
}
