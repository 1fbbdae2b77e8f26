//! Error types for muse-ai

use thiserror::Error;

/// Result type alias using muse-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when interacting with LLM providers
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Invalid API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Stream was aborted
    #[error("Request aborted")]
    Aborted,

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The provider did not answer within the configured bound
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::RateLimited { .. } | Error::Sse(_) | Error::Timeout(_) => true,
            Error::Api {
                error_type,
                message,
            } => {
                let et = error_type.to_lowercase();
                let msg = message.to_lowercase();
                et.contains("rate_limit")
                    || et.contains("overloaded")
                    || et.contains("server_error")
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_limit_is_retryable() {
        assert!(Error::RateLimited { retry_after: Some(3) }.is_retryable());
        assert!(Error::api("rate_limit_exceeded", "slow down").is_retryable());
        assert!(Error::api("invalid_request", "Too Many Requests").is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        assert!(Error::Timeout(Duration::from_secs(5)).is_retryable());
    }

    #[test]
    fn test_auth_and_config_not_retryable() {
        assert!(!Error::InvalidApiKey.is_retryable());
        assert!(!Error::InvalidConfig("no base url".into()).is_retryable());
        assert!(!Error::api("invalid_request_error", "bad field").is_retryable());
    }
}
