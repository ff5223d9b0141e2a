//! Error types for relay-streams.

use thiserror::Error;

/// Top-level error type for stream coordination operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A required setup value was missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An operation was attempted against a handle lacking the required
    /// capability, or against a group that does not exist.
    #[error("Capability error: {0}")]
    Capability(String),

    /// A consumer identity could not be created or persisted.
    #[error("Failed to register consumer '{consumer}' in group '{group}' on stream '{stream}'")]
    Registration {
        stream: String,
        group: String,
        consumer: String,
    },

    /// The consumer identity scan exceeded its bound without finding a free id.
    #[error("Consumer id scan exhausted for group '{group}' on stream '{stream}' (bound {bound})")]
    AllocationExhausted {
        stream: String,
        group: String,
        bound: u32,
    },

    /// A message id string did not match `<ms>-<seq>`.
    #[error("Malformed message id '{0}': expected <milliseconds>-<sequence>")]
    Format(String),

    /// The underlying transport call failed.
    #[error("Transport error: {0}")]
    Transport(#[from] redis::RedisError),
}

/// Result type alias for stream coordination operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_displays_message() {
        let error = Error::Configuration("missing start id".to_string());
        assert!(error.to_string().contains("Configuration error"));
        assert!(error.to_string().contains("missing start id"));
    }

    #[test]
    fn registration_error_names_all_parts() {
        let error = Error::Registration {
            stream: "orders".to_string(),
            group: "billing".to_string(),
            consumer: "3".to_string(),
        };
        let text = error.to_string();
        assert!(text.contains("orders"));
        assert!(text.contains("billing"));
        assert!(text.contains("'3'"));
    }

    #[test]
    fn format_error_shows_offending_input() {
        let error = Error::Format("abc".to_string());
        assert!(error.to_string().contains("'abc'"));
    }

    #[test]
    fn transport_error_converts_from_redis_error() {
        let redis_error = redis::RedisError::from((redis::ErrorKind::IoError, "connection reset"));
        let error: Error = redis_error.into();
        assert!(matches!(error, Error::Transport(_)));
        assert!(error.to_string().contains("Transport error"));
    }
}
