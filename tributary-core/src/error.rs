//! Error types for the tributary sender stack.

use thiserror::Error;

/// Main error type for sender, transaction and configuration operations.
///
/// Errors are cloneable because a single failure (for example a close
/// timeout) may need to be reported to every pending send at once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Credentials were rejected by the broker
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Broker supplied reason
        message: String,
    },

    /// The principal is not allowed to perform the operation
    #[error("Authorization failed: {message}")]
    Authorization {
        /// Broker supplied reason
        message: String,
    },

    /// The destination topic does not exist or has an illegal name
    #[error("Invalid topic: {topic}")]
    InvalidTopic {
        /// Offending topic name
        topic: String,
    },

    /// No leader is currently elected for the destination partition
    #[error("Leader not available for {topic}-{partition}")]
    LeaderNotAvailable {
        /// Topic of the partition
        topic: String,
        /// Partition number
        partition: i32,
    },

    /// Any other broker-reported failure
    #[error("Broker error: {message}")]
    Broker {
        /// Broker supplied reason
        message: String,
        /// Whether the client may retry the request on its own
        retriable: bool,
    },

    /// An operation did not complete before its deadline
    #[error("Timed out: {operation}")]
    Timeout {
        /// The operation that timed out
        operation: String,
    },

    /// An operation was invoked out of sequence
    #[error("Illegal state: {message}")]
    IllegalState {
        /// Description of the violated precondition
        message: String,
    },

    /// The producer has been closed
    #[error("Producer is closed")]
    Closed,

    /// Key or value serialization failed
    #[error("Serialization error: {message}")]
    Serialization {
        /// Serializer supplied reason
        message: String,
    },

    /// Invalid or missing configuration
    #[error("Configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },

    /// Internal system errors
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure
        message: String,
    },
}

/// Result type alias for tributary operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build an [`Error::IllegalState`].
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState { message: message.into() }
    }

    /// Build an [`Error::Timeout`].
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout { operation: operation.into() }
    }

    /// Build an [`Error::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Build an [`Error::Serialization`].
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    /// Build an [`Error::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Returns true for authentication failures, the default fatal class.
    #[must_use]
    pub const fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Returns true for out-of-sequence transaction or send calls.
    #[must_use]
    pub const fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState { .. })
    }

    /// Returns true when the underlying client would retry this failure itself.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        match self {
            Self::LeaderNotAvailable { .. } | Self::Timeout { .. } => true,
            Self::Broker { retriable, .. } => *retriable,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization { message: err.to_string() }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration { message: err.to_string() }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Configuration { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let auth = Error::Authentication { message: "bad password".to_string() };
        assert!(auth.is_authentication());
        assert!(!auth.is_retriable());

        let leader = Error::LeaderNotAvailable { topic: "orders".to_string(), partition: 2 };
        assert!(leader.is_retriable());
        assert_eq!(leader.to_string(), "Leader not available for orders-2");

        let broker = Error::Broker { message: "not enough replicas".to_string(), retriable: true };
        assert!(broker.is_retriable());

        assert!(Error::illegal_state("no transaction").is_illegal_state());
        assert!(!Error::Closed.is_retriable());
    }

    #[test]
    fn test_json_error_conversion() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        let converted: Error = err.into();
        assert!(matches!(converted, Error::Serialization { .. }));
    }
}
