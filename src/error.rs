//! Gateway error taxonomy.
//!
//! The `Display` text of every variant is the detailed, server-side log line.
//! What a git client gets to see is [`GatewayError::public_message`], which
//! deliberately collapses "not found" and "denied" into one sentence.

use thiserror::Error;

use crate::auth::access::DenyReason;

/// The single sentence sent to clients for both missing and forbidden
/// repositories.
pub const ACCESS_DENIED_MESSAGE: &str = "Repository does not exist or you do not have access";

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Handshake-level rejection; no application response is produced.
    #[error("transport rejected: {0}")]
    TransportReject(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(DenyReason),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("malformed request: {0}")]
    ProtocolMalformed(String),

    #[error("git subprocess failed: {0}")]
    SubprocessFailure(String),

    #[error("storage failure: {0}")]
    Storage(#[from] crate::db::Error),
}

impl GatewayError {
    /// Client-facing text. Never reveals whether a repository exists.
    pub fn public_message(&self) -> &'static str {
        match self {
            GatewayError::TransportReject(_) | GatewayError::AuthenticationFailed(_) => {
                "Authentication failed"
            }
            GatewayError::AuthorizationDenied(_) | GatewayError::ResourceNotFound(_) => {
                ACCESS_DENIED_MESSAGE
            }
            GatewayError::ProtocolMalformed(_) => "Invalid request",
            GatewayError::SubprocessFailure(_) | GatewayError::Storage(_) => "Internal error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_and_missing_look_identical_on_the_wire() {
        let denied = GatewayError::AuthorizationDenied(DenyReason::MirrorReadOnly);
        let missing = GatewayError::ResourceNotFound("alice/nope".into());
        assert_eq!(denied.public_message(), missing.public_message());
        assert_ne!(denied.to_string(), missing.to_string());
    }

    #[test]
    fn display_keeps_detail_for_logs() {
        let err = GatewayError::ProtocolMalformed("unknown verb 'rm'".into());
        assert_eq!(err.to_string(), "malformed request: unknown verb 'rm'");
        assert_eq!(err.public_message(), "Invalid request");
    }
}
