//! The error kinds surfaced across the core.  Hot-path I/O errors are
//! converted into a kind at the first boundary; the optional tag is a
//! machine-readable detail for the presentation layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Cancelled,
    Timeout,
    AuthRequired,
    AuthFailed,
    HostKeyMismatch,
    Unreachable,
    ProtocolViolation,
    ResourceExhausted,
    NotFound,
    AlreadyExists,
    /// The chain-lock or a node-lock is held; try again shortly.
    BusyRetryLater,
    Unsupported,
    /// Retryable by the reconnection orchestrator.
    Transient,
    Internal,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    /// e.g. `CHAIN_LOCK_BUSY`, `NODE_LOCK_BUSY`,
    /// `CONNECTION_CHAIN_FAILED: position 2/3`.
    pub tag: Option<String>,
    pub message: String,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            tag: None,
            message: message.into(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{what} not found"))
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Internal, format!("{err:#}"))
    }

    /// Whether the orchestrator should retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::Unreachable
        )
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        classify_transport_error(&format!("{err:#}"))
    }
}

impl From<vault::VaultError> for CoreError {
    fn from(err: vault::VaultError) -> Self {
        let kind = match &err {
            vault::VaultError::BadPassphrase => ErrorKind::AuthFailed,
            vault::VaultError::Locked => ErrorKind::AuthRequired,
            vault::VaultError::Corrupt(_) => ErrorKind::ProtocolViolation,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, err.to_string())
    }
}

/// Map the flattened message of a transport-layer failure onto a kind.
/// The ssh layer reports connection progress as rendered strings, so
/// classification is by the boundary context strings it attaches.
pub fn classify_transport_error(message: &str) -> CoreError {
    let lower = message.to_ascii_lowercase();
    let kind = if lower.contains("authentication") || lower.contains("auth") {
        ErrorKind::AuthFailed
    } else if lower.contains("host key") || lower.contains("host verification") {
        ErrorKind::HostKeyMismatch
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ErrorKind::Timeout
    } else if lower.contains("connecting to")
        || lower.contains("resolving")
        || lower.contains("connection refused")
        || lower.contains("unreachable")
        || lower.contains("did not resolve")
    {
        ErrorKind::Unreachable
    } else if lower.contains("handshake") {
        ErrorKind::Transient
    } else {
        ErrorKind::Transient
    };
    CoreError::new(kind, message.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_auth() {
        let err = classify_transport_error("authentication: Password authentication was not accepted");
        assert_eq!(err.kind, ErrorKind::AuthFailed);
    }

    #[test]
    fn classify_unreachable() {
        let err = classify_transport_error("connecting to db.internal:22: Connection refused");
        assert_eq!(err.kind, ErrorKind::Unreachable);
        assert!(err.is_retryable());
    }

    #[test]
    fn classify_host_key() {
        let err = classify_transport_error("host verification: Host key verification failed");
        assert_eq!(err.kind, ErrorKind::HostKeyMismatch);
        assert!(!err.is_retryable());
    }

    #[test]
    fn tags_render() {
        let err = CoreError::new(ErrorKind::BusyRetryLater, "chain lock is held")
            .with_tag("CHAIN_LOCK_BUSY");
        assert_eq!(err.tag.as_deref(), Some("CHAIN_LOCK_BUSY"));
    }
}
