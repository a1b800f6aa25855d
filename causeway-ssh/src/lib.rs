//! A convenience layer over libssh2 for the session core.
//! Each transport runs on its own thread; callers hold a cheap
//! [`Session`] handle over the thread's request queue, and channel I/O
//! is bridged onto duplex socketpairs so the rest of the process can
//! treat SSH channels as ordinary descriptors.
//!
//! Connection setup streams [`SessionEvent`]s: secret prompts answered
//! by the consumer, host-key recording under the configured
//! trust-on-first-use policy, then [`SessionEvent::Ready`] — or
//! [`SessionEvent::Failed`] with a typed [`SshError`].

pub mod auth;
pub mod config;
mod error;
mod host;
pub mod pty;
pub mod session;
pub mod sftp;
mod transport;

pub use auth::{Prompt, SecretPrompts};
pub use config::{Auth, SessionConfig, Stream};
pub use error::SshError;
pub use pty::{RemoteChild, RemotePty};
pub use session::{CommandStreams, RemoteBinding, Session, SessionEvent, Tunnel};
pub use sftp::{FileMetadata, OpenOptions, Sftp, SftpError, SftpFile};
