//! Failures of individual remote-store calls.

use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Low-level failure of a remote call. Translated into the agent's taxonomy
/// before it reaches a caller of [`crate::agent::BackupAgent`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// DNS, TCP or TLS failure; the request never got a response.
    #[error("object store unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// The store answered with an error status.
    #[error("object store returned {status} ({code}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    /// The request could not be built (bad parameters, unusable credentials).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("storage gateway is not running")]
    NotRunning,

    #[error("storage gateway is already running")]
    AlreadyRunning,

    /// The worker thread or its runtime failed.
    #[error("storage worker failed: {0}")]
    Worker(String),
}

impl ClientError {
    pub fn service(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        ClientError::Service {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(key: &str) -> Self {
        ClientError::service(404, "NoSuchKey", format!("no object at {}", key))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::Service { status, code, .. } => {
                code != "NoSuchBucket"
                    && (*status == 404 || code == "NoSuchKey" || code == "NotFound")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        assert!(ClientError::not_found("a/b.tar").is_not_found());
        assert!(ClientError::service(404, "NotFound", "").is_not_found());
        assert!(!ClientError::service(404, "NoSuchBucket", "").is_not_found());
        assert!(!ClientError::service(403, "AccessDenied", "").is_not_found());
        assert!(!ClientError::Timeout("slow".into()).is_not_found());
    }
}
