//! Error types for the Relay runtime

use thiserror::Error;

/// Errors surfaced by [`RelayManager`](crate::RelayManager) operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// An operation was attempted before `configure` completed
    #[error("Relay manager is not configured")]
    NotConfigured,

    /// A pub/sub operation was attempted without an active session
    #[error("Not connected")]
    NotConnected,

    /// The messaging transport could not establish a session
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport rejected a subscription
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// The transport rejected a publish
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// An inbound payload could not be decoded
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// A REST request could not be formed or its response was unusable
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// No HTTP response was received (connect failure, timeout, reset)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The REST API answered with a status outside 200-299
    #[error("API error: {message}")]
    Api { status: u16, message: String },

    /// A successful REST response body did not match the expected shape
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The configuration passed to `configure` was rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The manager has been shut down
    #[error("Relay manager shut down")]
    Shutdown,
}

impl RelayError {
    /// Build the error for a non-2xx HTTP status
    pub(crate) fn api(status: u16) -> Self {
        RelayError::Api {
            status,
            message: format!("Status code: {}", status),
        }
    }

    /// HTTP status carried by an [`RelayError::Api`] error
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RelayError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type for Relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_configured() {
        let err = RelayError::NotConfigured;
        assert_eq!(err.to_string(), "Relay manager is not configured");
    }

    #[test]
    fn test_error_display_not_connected() {
        let err = RelayError::NotConnected;
        assert_eq!(err.to_string(), "Not connected");
    }

    #[test]
    fn test_error_display_connection_failed() {
        let err = RelayError::ConnectionFailed("connection refused".to_string());
        assert_eq!(err.to_string(), "Connection failed: connection refused");
    }

    #[test]
    fn test_error_display_publish_failed() {
        let err = RelayError::PublishFailed("bad subject".to_string());
        assert_eq!(err.to_string(), "Publish failed: bad subject");
    }

    #[test]
    fn test_api_error_carries_status() {
        let err = RelayError::api(404);
        assert_eq!(err.to_string(), "API error: Status code: 404");
        assert_eq!(err.status_code(), Some(404));
        assert!(matches!(
            err,
            RelayError::Api { status: 404, ref message } if message == "Status code: 404"
        ));
    }

    #[test]
    fn test_status_code_absent_for_other_errors() {
        assert_eq!(RelayError::NotConnected.status_code(), None);
        assert_eq!(RelayError::Shutdown.status_code(), None);
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<u64>("\"not a number\"").unwrap_err();
        let err: RelayError = json_err.into();
        assert!(matches!(err, RelayError::Decode(_)));
        assert!(err.to_string().starts_with("Decode error:"));
    }

    #[test]
    fn test_error_debug() {
        let err = RelayError::SubscriptionFailed("denied".to_string());
        let debug = format!("{:?}", err);
        assert!(debug.contains("SubscriptionFailed"));
        assert!(debug.contains("denied"));
    }
}
