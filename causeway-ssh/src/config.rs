//! Connection configuration for a single transport.

use filedescriptor::FileDescriptor;
use std::path::PathBuf;
use std::time::Duration;

/// How to authenticate against the server.  Secret material (passwords,
/// key passphrases) is never stored here; it is requested through
/// [`crate::SecretPrompts`] so the caller can answer from its vault or
/// from the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Auth {
    /// Password auth; the password arrives via a secret prompt.
    Password,
    /// Key-file auth.  A passphrase prompt is raised only if the first,
    /// passphrase-less attempt is rejected.
    Key { key_path: PathBuf },
    /// Certificate auth: the signed certificate is presented alongside
    /// the private key.
    Certificate {
        key_path: PathBuf,
        cert_path: PathBuf,
    },
    /// Any identity the running ssh-agent offers.
    Agent,
    /// keyboard-interactive; every prompt goes to the caller.
    Interactive,
}

/// Where the transport's byte stream comes from.
pub enum Stream {
    /// Plain TCP to the configured host and port.
    Tcp,
    /// An already-established descriptor, e.g. the near end of a
    /// tunnel through a bastion.  SSH is negotiated over whatever this
    /// descriptor is connected to.
    Fd(FileDescriptor),
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Stream::Tcp => write!(fmt, "Stream::Tcp"),
            Stream::Fd(_) => write!(fmt, "Stream::Fd(..)"),
        }
    }
}

#[derive(Debug)]
pub struct SessionConfig {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub auth: Auth,
    /// Path to the known_hosts file used for trust-on-first-use
    /// verification.  `None` falls back to `~/.ssh/known_hosts`.
    pub known_hosts_path: Option<PathBuf>,
    /// Trust-on-first-use policy: record an unknown host key and carry
    /// on, or refuse with `SshError::HostKeyUnknown`.  A key that
    /// contradicts the file is always fatal.
    pub trust_unknown_hosts: bool,
    pub connect_timeout: Duration,
    /// Interval between server keepalive probes, also configured into
    /// libssh2 so the transport answers server-side probes.
    pub keepalive_interval: Duration,
    pub stream: Stream,
}

impl SessionConfig {
    pub fn new(hostname: &str, port: u16, user: &str, auth: Auth) -> Self {
        Self {
            hostname: hostname.to_string(),
            port,
            user: user.to_string(),
            auth,
            known_hosts_path: None,
            trust_unknown_hosts: true,
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            stream: Stream::Tcp,
        }
    }

    pub fn via(mut self, fd: FileDescriptor) -> Self {
        self.stream = Stream::Fd(fd);
        self
    }

    /// Refuse servers whose key is not already in known_hosts.
    pub fn require_known_host(mut self) -> Self {
        self.trust_unknown_hosts = false;
        self
    }

    pub fn known_hosts<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub(crate) fn known_hosts_file(&self) -> PathBuf {
        match &self.known_hosts_path {
            Some(path) => path.clone(),
            None => dirs_next::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ssh")
                .join("known_hosts"),
        }
    }
}
