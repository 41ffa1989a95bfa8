//! Error types for shared store operations.

use snafu::Snafu;

/// Errors returned by a [`SharedStore`](crate::SharedStore) backend.
///
/// Coordination primitives never surface these to their callers. They are
/// classified with [`StoreError::is_unavailable`] and turned into a fallback,
/// a refusal, or a logged no-op depending on the operation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The store cannot be reached or has been marked unavailable.
    #[snafu(display("store unavailable: {reason}"))]
    Unavailable {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// A store operation did not complete within its time budget.
    #[snafu(display("store operation '{operation}' timed out after {duration_ms}ms"))]
    Timeout {
        /// Name of the operation that timed out.
        operation: String,
        /// The budget that was exceeded.
        duration_ms: u64,
    },

    /// The store URL could not be parsed.
    #[snafu(display("invalid store url '{url}': {reason}"))]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why the client rejected it.
        reason: String,
    },

    /// A script returned a reply that does not match its declared shape.
    #[snafu(display("unexpected reply from script '{script}': {reason}"))]
    UnexpectedReply {
        /// Name of the script.
        script: &'static str,
        /// What was wrong with the reply.
        reason: String,
    },

    /// Error reported by the Redis client.
    #[snafu(display("redis error: {source}"))]
    Redis {
        /// The underlying client error.
        source: redis::RedisError,
    },
}

impl StoreError {
    /// Returns true if the error means the store could not be consulted at all.
    ///
    /// Reply-shape errors are bugs rather than outages and return false.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable { .. } | StoreError::Timeout { .. } => true,
            StoreError::Redis { source } => {
                source.is_io_error()
                    || source.is_connection_dropped()
                    || source.is_connection_refusal()
                    || source.is_timeout()
            }
            StoreError::InvalidUrl { .. } | StoreError::UnexpectedReply { .. } => false,
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(source: redis::RedisError) -> Self {
        StoreError::Redis { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_display() {
        let err = StoreError::Unavailable {
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "store unavailable: connection refused");
        assert!(err.is_unavailable());
    }

    #[test]
    fn timeout_is_unavailable() {
        let err = StoreError::Timeout {
            operation: "GET".to_string(),
            duration_ms: 500,
        };
        assert_eq!(err.to_string(), "store operation 'GET' timed out after 500ms");
        assert!(err.is_unavailable());
    }

    #[test]
    fn invalid_url_is_not_unavailable() {
        let err = StoreError::InvalidUrl {
            url: "not a url".to_string(),
            reason: "did not parse".to_string(),
        };
        assert_eq!(err.to_string(), "invalid store url 'not a url': did not parse");
        assert!(!err.is_unavailable());
    }

    #[test]
    fn unexpected_reply_is_not_unavailable() {
        let err = StoreError::UnexpectedReply {
            script: "consume_token",
            reason: "expected bucket".to_string(),
        };
        assert!(!err.is_unavailable());
    }
}
