//! Error types for the sign-in handshake.

use std::fmt;

use thiserror::Error;

/// Errors raised by the handshake collaborators.
///
/// Every variant is caught at the state machine boundary; none of them
/// reach a front end as an unhandled error.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The external browsing context could not be opened.
    #[error("Failed to open authorization page: {0}")]
    Launch(String),

    /// Network or provider failure during code exchange or account lookup.
    #[error("{operation} failed{}: {detail}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Exchange {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },

    /// Credential persistence failed on read, write or remove.
    #[error("Credential storage error: {0}")]
    Storage(String),
}

/// Coarse error category, passed to the alert collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Launch,
    Exchange,
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Launch => write!(f, "launch"),
            ErrorKind::Exchange => write!(f, "exchange"),
            ErrorKind::Storage => write!(f, "storage"),
        }
    }
}

impl AuthError {
    pub(crate) fn transport(operation: &'static str, err: reqwest::Error) -> Self {
        AuthError::Exchange {
            operation,
            status: err.status().map(|s| s.as_u16()),
            detail: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Launch(_) => ErrorKind::Launch,
            AuthError::Exchange { .. } => ErrorKind::Exchange,
            AuthError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Message suitable for showing to the user. Never includes response
    /// bodies or other provider detail.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Launch => "Could not open the GitHub sign-in page. Please try again.",
            ErrorKind::Exchange => "Sign-in with GitHub failed. Please try again.",
            ErrorKind::Storage => "Could not save your session on this device.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_display_includes_status() {
        let err = AuthError::Exchange {
            operation: "code exchange",
            status: Some(502),
            detail: "bad gateway".to_string(),
        };
        assert_eq!(err.to_string(), "code exchange failed (HTTP 502): bad gateway");

        let err = AuthError::Exchange {
            operation: "account lookup",
            status: None,
            detail: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "account lookup failed: connection refused");
    }

    #[test]
    fn test_user_message_is_generic() {
        let err = AuthError::Exchange {
            operation: "code exchange",
            status: Some(500),
            detail: "stack trace with secrets".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Exchange);
        assert!(!err.user_message().contains("secrets"));
        assert_eq!(AuthError::Storage("disk full".into()).kind().to_string(), "storage");
    }
}
