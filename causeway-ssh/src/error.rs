//! Failure vocabulary for a transport.  Connection setup reports one
//! of these through [`crate::SessionEvent::Failed`] so the caller can
//! tell retryable network trouble apart from auth and trust failures
//! without parsing strings.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("connecting to {remote}: {message}")]
    Connect { remote: String, message: String },

    #[error("ssh handshake with {remote}: {message}")]
    Handshake { remote: String, message: String },

    /// The server's key is not in the known_hosts file and the config
    /// forbids recording it unattended.
    #[error("{remote} has no known_hosts entry (offered {fingerprint}); \
             refusing to record it unattended")]
    HostKeyUnknown { remote: String, fingerprint: String },

    /// The server's key contradicts what the known_hosts file says.
    #[error("host key for {remote} does not match {file}; the server offered {fingerprint}")]
    HostKeyMismatch {
        remote: String,
        fingerprint: String,
        file: PathBuf,
    },

    #[error("authenticating {user}@{remote}: {message}")]
    Auth {
        user: String,
        remote: String,
        message: String,
    },

    /// A secret prompt went unanswered; nothing more can happen
    /// without the user.
    #[error("authentication prompt was cancelled")]
    Cancelled,

    #[error("transport: {message}")]
    Transport { message: String },
}

impl SshError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        SshError::Transport {
            message: format!("{err:#}"),
        }
    }
}
