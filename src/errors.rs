use thiserror::Error;

/// Coarse classification of an [`AgentError`], for callers that branch on
/// the failure kind (e.g. re-authenticate vs. retry later).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionFailed,
    AuthenticationFailed,
    NotFound,
    InvalidConfiguration,
    TransferFailed,
    TimedOut,
}

#[derive(Error, Debug)]
pub enum AgentError {
    /// Endpoint unreachable, DNS failure, or the storage worker is gone.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Credentials rejected or expired.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    /// Malformed bucket, endpoint, region pairing or backup id.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The store rejected a put, part upload or completion on an otherwise healthy connection.
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// The client's own request or connect timeout elapsed.
    #[error("Request timed out: {0}")]
    TimedOut(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            AgentError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            AgentError::NotFound(_) => ErrorKind::NotFound,
            AgentError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            AgentError::TransferFailed(_) => ErrorKind::TransferFailed,
            AgentError::TimedOut(_) => ErrorKind::TimedOut,
        }
    }

    /// True when the caller should ask for fresh credentials rather than retry.
    pub fn requires_reauthentication(&self) -> bool {
        self.kind() == ErrorKind::AuthenticationFailed
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(AgentError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(AgentError::TimedOut("x".into()).kind(), ErrorKind::TimedOut);
        assert_eq!(
            AgentError::InvalidConfiguration("x".into()).kind(),
            ErrorKind::InvalidConfiguration
        );
    }

    #[test]
    fn test_message_names_the_kind() {
        let err = AgentError::AuthenticationFailed("InvalidAccessKeyId".into());
        assert_eq!(err.to_string(), "Authentication failed: InvalidAccessKeyId");
        assert!(err.requires_reauthentication());
        assert!(!AgentError::ConnectionFailed("down".into()).requires_reauthentication());
    }
}
