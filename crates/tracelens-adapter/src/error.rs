//! Error types for tracelens-adapter

use thiserror::Error;
use tracelens_core::ApmError;

/// Errors raised while talking to the adapter service
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Network/HTTP error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-2xx answer from the adapter service
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// The adapter answered with `success = false`
    #[error("{0}")]
    Rejected(String),

    /// Response body is not a valid envelope
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AdapterError {
    /// Check if this error is worth retrying by the caller
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::Network(err) => err.is_timeout() || err.is_connect(),
            AdapterError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        AdapterError::Server {
            status,
            message: message.into(),
        }
    }
}

impl From<AdapterError> for ApmError {
    fn from(err: AdapterError) -> Self {
        ApmError::upstream(err)
    }
}

/// Result type for adapter operations
pub type AdapterResult<T> = Result<T, AdapterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(AdapterError::server(503, "unavailable").is_retryable());
        assert!(!AdapterError::server(400, "bad request").is_retryable());
        assert!(!AdapterError::Rejected("no such trace".to_string()).is_retryable());
    }

    #[test]
    fn test_into_upstream() {
        let err: ApmError = AdapterError::Rejected("backend down".to_string()).into();
        assert!(err.is_upstream());
        assert_eq!(err.to_string(), "adapter error: backend down");
    }
}
