use crate::errors::AgentError;
use crate::storage::ClientError;

/// Service error codes that mean the credentials were refused.
const AUTH_CODES: &[&str] = &[
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "AccessDenied",
    "ExpiredToken",
    "InvalidToken",
    "TokenRefreshRequired",
];

/// Service error codes that mean the bucket itself is wrong.
const BUCKET_CODES: &[&str] = &["NoSuchBucket", "InvalidBucketName"];

/// Map a remote-call failure onto the agent taxonomy. `context` names what
/// was being attempted and is prefixed to the message. A missing key is
/// reported as [`AgentError::NotFound`].
pub fn translate(error: ClientError, context: &str) -> AgentError {
    classify(error, context, true)
}

/// Like [`translate`], for writes and multipart steps: a 404 there (an
/// expired upload, say) means the transfer failed, not that a backup is
/// missing.
pub fn translate_transfer(error: ClientError, context: &str) -> AgentError {
    classify(error, context, false)
}

fn classify(error: ClientError, context: &str, missing_is_not_found: bool) -> AgentError {
    let message = format!("{}: {}", context, error);
    match error {
        ClientError::Unreachable(_) | ClientError::NotRunning | ClientError::Worker(_) => {
            AgentError::ConnectionFailed(message)
        }
        ClientError::Timeout(_) => AgentError::TimedOut(message),
        ClientError::Service { status, ref code, .. } => {
            if status == 401 || status == 403 || AUTH_CODES.contains(&code.as_str()) {
                AgentError::AuthenticationFailed(message)
            } else if BUCKET_CODES.contains(&code.as_str()) {
                AgentError::InvalidConfiguration(message)
            } else if missing_is_not_found && error.is_not_found() {
                AgentError::NotFound(message)
            } else {
                AgentError::TransferFailed(message)
            }
        }
        ClientError::InvalidRequest(_) | ClientError::AlreadyRunning => {
            AgentError::InvalidConfiguration(message)
        }
        ClientError::MalformedResponse(_) => AgentError::TransferFailed(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn kind(error: ClientError) -> ErrorKind {
        translate(error, "test").kind()
    }

    #[test]
    fn test_transport_failures() {
        assert_eq!(kind(ClientError::Unreachable("dns".into())), ErrorKind::ConnectionFailed);
        assert_eq!(kind(ClientError::NotRunning), ErrorKind::ConnectionFailed);
        assert_eq!(kind(ClientError::Worker("panic".into())), ErrorKind::ConnectionFailed);
        assert_eq!(kind(ClientError::Timeout("30s".into())), ErrorKind::TimedOut);
    }

    #[test]
    fn test_service_failures() {
        assert_eq!(
            kind(ClientError::service(403, "AccessDenied", "")),
            ErrorKind::AuthenticationFailed
        );
        assert_eq!(
            kind(ClientError::service(400, "ExpiredToken", "")),
            ErrorKind::AuthenticationFailed
        );
        assert_eq!(
            kind(ClientError::service(404, "NoSuchBucket", "")),
            ErrorKind::InvalidConfiguration
        );
        assert_eq!(kind(ClientError::not_found("k")), ErrorKind::NotFound);
        assert_eq!(
            kind(ClientError::service(400, "EntityTooSmall", "")),
            ErrorKind::TransferFailed
        );
        assert_eq!(
            kind(ClientError::service(503, "SlowDown", "")),
            ErrorKind::TransferFailed
        );
    }

    #[test]
    fn test_missing_key_during_transfer() {
        let expired = ClientError::service(404, "NoSuchUpload", "upload expired");
        assert_eq!(
            translate_transfer(expired.clone(), "uploading").kind(),
            ErrorKind::TransferFailed
        );
        assert_eq!(translate(expired, "fetching").kind(), ErrorKind::NotFound);
        assert_eq!(
            translate_transfer(ClientError::service(403, "AccessDenied", ""), "uploading").kind(),
            ErrorKind::AuthenticationFailed
        );
        assert_eq!(
            translate_transfer(ClientError::service(404, "NoSuchBucket", ""), "uploading").kind(),
            ErrorKind::InvalidConfiguration
        );
    }

    #[test]
    fn test_local_failures() {
        assert_eq!(
            kind(ClientError::InvalidRequest("bad key".into())),
            ErrorKind::InvalidConfiguration
        );
        assert_eq!(kind(ClientError::AlreadyRunning), ErrorKind::InvalidConfiguration);
        assert_eq!(
            kind(ClientError::MalformedResponse("no etag".into())),
            ErrorKind::TransferFailed
        );
    }

    #[test]
    fn test_message_keeps_context_and_cause() {
        let err = translate(ClientError::service(403, "AccessDenied", "nope"), "storing abc");
        assert_eq!(
            err.to_string(),
            "Authentication failed: storing abc: object store returned 403 (AccessDenied): nope"
        );
    }
}
