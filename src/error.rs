//! Error types for the event shipper client.

use reqwest::StatusCode;
use thiserror::Error;

use crate::limit::RateLimit;

/// Errors that can occur while talking to the ingestion API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The category is rate limited. `short_circuited` is true when the request was
    /// never sent because cached limit state already showed it would be rejected.
    #[error("rate limited: {limit}")]
    RateLimited {
        limit: RateLimit,
        short_circuited: bool,
    },

    /// HTTP request failed before a response was received
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Request timeout
    #[error("request timed out")]
    Timeout,

    /// Server returned an error status code
    #[error("server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    /// Failed to parse response body
    #[error("failed to parse response: {0}")]
    Parse(String),

    /// Failed to encode events for the request body
    #[error("failed to encode events: {0}")]
    Encode(#[from] serde_json::Error),

    /// Client configuration error
    #[error("client configuration error: {0}")]
    Config(String),

    /// Background work was requested outside a Tokio runtime
    #[error("no async runtime available: {0}")]
    Runtime(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

impl ClientError {
    /// Whether waiting and trying again could succeed.
    ///
    /// Rate limits, timeouts, connection failures and 5xx responses are
    /// transient. Client errors and encoding problems are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::RateLimited { .. } | ClientError::Timeout => true,
            ClientError::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ClientError::Status { code, .. } => is_retryable_status(*code),
            ClientError::Parse(_)
            | ClientError::Encode(_)
            | ClientError::Config(_)
            | ClientError::Runtime(_) => false,
        }
    }

    /// True for a rate-limit failure synthesized locally without a network call.
    pub fn is_short_circuited(&self) -> bool {
        matches!(
            self,
            ClientError::RateLimited {
                short_circuited: true,
                ..
            }
        )
    }
}

/// Statuses the transport retries before giving up.
pub(crate) fn is_retryable_status(code: StatusCode) -> bool {
    matches!(
        code,
        StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Result type alias for client operations.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limit::{Category, Scope};

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Timeout;
        assert_eq!(format!("{}", err), "request timed out");

        let err = ClientError::Status {
            code: StatusCode::BAD_REQUEST,
            message: "invalid dataset name".to_string(),
        };
        assert!(format!("{}", err).contains("400"));
        assert!(format!("{}", err).contains("invalid dataset name"));
    }

    #[test]
    fn test_retryable_statuses() {
        for code in [500, 502, 503, 504] {
            let err = ClientError::Status {
                code: StatusCode::from_u16(code).unwrap(),
                message: String::new(),
            };
            assert!(err.is_retryable(), "status {code} should be retryable");
        }

        for code in [400, 401, 403, 404, 422, 501] {
            let err = ClientError::Status {
                code: StatusCode::from_u16(code).unwrap(),
                message: String::new(),
            };
            assert!(!err.is_retryable(), "status {code} should not be retryable");
        }
    }

    #[test]
    fn test_rate_limited_flags() {
        let limit = RateLimit::unknown(Category::Ingest, Scope::Unknown);

        let local = ClientError::RateLimited {
            limit: limit.clone(),
            short_circuited: true,
        };
        assert!(local.is_short_circuited());
        assert!(local.is_retryable());

        let remote = ClientError::RateLimited {
            limit,
            short_circuited: false,
        };
        assert!(!remote.is_short_circuited());
        assert!(format!("{}", remote).starts_with("rate limited"));
    }

    #[test]
    fn test_non_retryable_errors() {
        assert!(!ClientError::Parse("bad json".to_string()).is_retryable());
        assert!(!ClientError::Config("no token".to_string()).is_retryable());
        assert!(!ClientError::Runtime("no reactor".to_string()).is_retryable());
    }
}
