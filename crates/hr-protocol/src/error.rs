//! Error types for the relay protocol client.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Error types for calls against the cloud gateway.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A device-token endpoint was called before activation. Raised before
    /// any network I/O happens.
    #[error("device token is not set; run activation first")]
    NoDeviceToken,

    /// The request exceeded the per-request timeout.
    #[error("request timed out")]
    Timeout,

    /// Connection-level failure (reset, DNS, TLS, ...).
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx response from the gateway.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The 2xx body did not match the documented shape.
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl ProtocolError {
    /// Transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProtocolError::Timeout | ProtocolError::Network(_) => true,
            ProtocolError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// A 401 from a device-token endpoint: the device was revoked.
    pub fn is_auth_revoked(&self) -> bool {
        matches!(self, ProtocolError::Api { status: 401, .. })
    }
}

impl From<reqwest::Error> for ProtocolError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProtocolError::Timeout
        } else if e.is_decode() {
            ProtocolError::Decode(e.to_string())
        } else {
            ProtocolError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_status_class() {
        assert!(ProtocolError::Timeout.is_retryable());
        assert!(ProtocolError::Network("reset".into()).is_retryable());
        assert!(ProtocolError::Api { status: 500, message: String::new() }.is_retryable());
        assert!(ProtocolError::Api { status: 429, message: String::new() }.is_retryable());
        assert!(!ProtocolError::Api { status: 400, message: String::new() }.is_retryable());
        assert!(!ProtocolError::NoDeviceToken.is_retryable());
    }

    #[test]
    fn revocation_is_a_plain_401() {
        assert!(ProtocolError::Api { status: 401, message: String::new() }.is_auth_revoked());
        assert!(!ProtocolError::Api { status: 403, message: String::new() }.is_auth_revoked());
        assert!(!ProtocolError::Timeout.is_auth_revoked());
    }
}
