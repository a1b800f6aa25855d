//! The node router: the only place that translates a stable node id
//! into a live connection, and the owner of bastion-chain acquisition.
//! To reach a node with a parent it first acquires the parent, then
//! lets the ssh layer negotiate the child transport over a tunnel
//! through it; depth is unbounded and the build is linear, guarded by
//! the chain lock.

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::node::{AuthDescriptor, NodeReadiness, NodeRecord};
use crate::pool::{ConnectionRecord, ConnectionState};
use crate::util;
use crate::Station;
use causeway_ssh::{Auth, Session, SessionConfig, SessionEvent, SshError};
use std::sync::Arc;

impl Station {
    /// Resolve a node to its live connection, building the chain if
    /// nothing is connected yet.  Fails fast with `BusyRetryLater`
    /// when the chain lock is held (a build or a recovery is running)
    /// or when the node is link-down and awaiting the orchestrator.
    pub async fn resolve_connection(&self, node_id: &str) -> CoreResult<Arc<ConnectionRecord>> {
        if let Some(connection_id) = self.node_connection(node_id) {
            if let Some(record) = self.pool.get(connection_id) {
                match record.state() {
                    ConnectionState::Active => return Ok(record),
                    ConnectionState::LinkDown | ConnectionState::Reconnecting => {
                        return Err(CoreError::new(
                            ErrorKind::BusyRetryLater,
                            format!("node {node_id} is awaiting reconnection"),
                        )
                        .with_tag("NODE_LINK_DOWN"));
                    }
                    _ => {}
                }
            }
        }

        let _guard = self.chain_lock.try_acquire().ok_or_else(|| {
            CoreError::new(ErrorKind::BusyRetryLater, "a chain build is in progress")
                .with_tag("CHAIN_LOCK_BUSY")
        })?;
        self.acquire_chain(node_id).await
    }

    /// Build (or reuse) every transport from the chain root down to
    /// `node_id`.  The caller must hold the chain lock.
    pub(crate) async fn acquire_chain(&self, node_id: &str) -> CoreResult<Arc<ConnectionRecord>> {
        let mut chain = self.ancestors_of(node_id)?;
        chain.push(node_id.to_string());
        let total = chain.len();

        let mut current: Option<Arc<ConnectionRecord>> = None;
        for (index, link_id) in chain.iter().enumerate() {
            // Reuse a healthy transport when one exists
            if let Some(connection_id) = self.node_connection(link_id) {
                if let Some(record) = self.pool.get(connection_id) {
                    if record.state() == ConnectionState::Active {
                        current = Some(record);
                        continue;
                    }
                }
            }

            let record = self
                .connect_node(link_id, current.as_deref())
                .await
                .map_err(|err| {
                    let err = err.with_tag(format!(
                        "CONNECTION_CHAIN_FAILED: position {}/{}",
                        index + 1,
                        total
                    ));
                    self.emit_node_error(link_id, err.clone());
                    self.emit_readiness(link_id, NodeReadiness::Errored);
                    err
                })?;
            current = Some(record);
        }

        current.ok_or_else(|| CoreError::internal("empty acquisition chain"))
    }

    /// Establish a single transport, tunnelled through the
    /// already-connected parent when the node has one.
    async fn connect_node(
        &self,
        node_id: &str,
        parent: Option<&ConnectionRecord>,
    ) -> CoreResult<Arc<ConnectionRecord>> {
        let record = self.node_record(node_id)?;
        self.emit_readiness(node_id, NodeReadiness::Connecting);

        let mut config = SessionConfig::new(
            &record.host,
            record.port,
            &record.username,
            auth_for(&record),
        )
        .known_hosts(self.config().data_dir().join("known_hosts"));
        config.connect_timeout = self.config().acquire_timeout();
        config.keepalive_interval = self.config().keepalive_interval();
        if !self.config().auto_accept_new_hosts {
            config = config.require_known_host();
        }

        let (session, events) = match parent {
            Some(parent) => {
                util::timeout(
                    self.config().channel_open_timeout(),
                    "chain hop",
                    async {
                        Session::connect_via(&parent.session, config)
                            .await
                            .map_err(CoreError::internal)
                    },
                )
                .await?
            }
            None => Session::connect(config).map_err(CoreError::internal)?,
        };

        util::timeout(
            self.config().acquire_timeout(),
            "connection acquisition",
            self.drive_session_events(node_id, &events),
        )
        .await?;

        let pooled = self.pool.insert(node_id, session);
        self.with_runtime(node_id, |runtime| {
            runtime.connection_id = Some(pooled.connection_id);
            runtime.readiness = NodeReadiness::Active;
        })?;
        self.emit_connection_bound(node_id, pooled.connection_id);
        self.emit_readiness(node_id, NodeReadiness::Active);
        log::debug!(
            "node {} bound to connection {}",
            node_id,
            pooled.connection_id
        );
        Ok(pooled)
    }

    /// Walk the setup events, answering secret prompts from the vault,
    /// until the transport is ready or reports a typed failure.
    async fn drive_session_events(
        &self,
        node_id: &str,
        events: &flume::Receiver<SessionEvent>,
    ) -> CoreResult<()> {
        while let Ok(event) = events.recv_async().await {
            match event {
                SessionEvent::Banner(Some(banner)) => {
                    log::debug!("node {}: {}", node_id, banner.trim_end());
                }
                SessionEvent::Banner(None) => {}
                SessionEvent::HostKeyRecorded { fingerprint } => {
                    log::info!("node {node_id}: trusted new host key {fingerprint}");
                }
                SessionEvent::NeedSecret(prompts) => {
                    let secret = self.vault_get(node_id).unwrap_or(None);
                    match secret {
                        Some(secret) => {
                            let answer = String::from_utf8_lossy(&secret).to_string();
                            let answers = vec![answer; prompts.prompts.len().max(1)];
                            prompts
                                .respond_async(answers)
                                .await
                                .map_err(CoreError::internal)?;
                        }
                        None => {
                            // Nothing stored; only the user can answer.
                            return Err(CoreError::new(
                                ErrorKind::AuthRequired,
                                format!(
                                    "node {node_id} requires interactive authentication \
                                     and no vault secret is stored"
                                ),
                            ));
                        }
                    }
                }
                SessionEvent::Failed(err) => {
                    return Err(CoreError::new(kind_for_ssh_error(&err), err.to_string()));
                }
                SessionEvent::Ready => return Ok(()),
            }
        }
        Err(CoreError::new(
            ErrorKind::Transient,
            "session ended before authenticating",
        ))
    }
}

/// Map the ssh layer's typed failures onto the core's error kinds.
fn kind_for_ssh_error(err: &SshError) -> ErrorKind {
    match err {
        SshError::Connect { .. } => ErrorKind::Unreachable,
        SshError::Handshake { .. } | SshError::Transport { .. } => ErrorKind::Transient,
        SshError::HostKeyUnknown { .. } | SshError::HostKeyMismatch { .. } => {
            ErrorKind::HostKeyMismatch
        }
        SshError::Auth { .. } => ErrorKind::AuthFailed,
        SshError::Cancelled => ErrorKind::AuthRequired,
    }
}

fn auth_for(record: &NodeRecord) -> Auth {
    match &record.auth {
        AuthDescriptor::Password => Auth::Password,
        AuthDescriptor::Key { key_path, .. } => Auth::Key {
            key_path: expand_home(key_path),
        },
        AuthDescriptor::Certificate {
            key_path,
            cert_path,
        } => Auth::Certificate {
            key_path: expand_home(key_path),
            cert_path: expand_home(cert_path),
        },
        AuthDescriptor::Agent => Auth::Agent,
        AuthDescriptor::Interactive => Auth::Interactive,
    }
}

fn expand_home(path: &str) -> std::path::PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => std::env::var_os("HOME")
            .map(|home| std::path::PathBuf::from(home).join(rest))
            .unwrap_or_else(|| path.into()),
        None => path.into(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expand_home_rewrites_tilde() {
        std::env::set_var("HOME", "/home/u");
        assert_eq!(
            expand_home("~/.ssh/id_ed25519"),
            std::path::PathBuf::from("/home/u/.ssh/id_ed25519")
        );
        assert_eq!(expand_home("/abs/key"), std::path::PathBuf::from("/abs/key"));
    }

    #[test]
    fn ssh_failures_map_to_kinds() {
        assert_eq!(
            kind_for_ssh_error(&SshError::Connect {
                remote: "b:22".to_string(),
                message: "connection refused".to_string(),
            }),
            ErrorKind::Unreachable
        );
        assert_eq!(
            kind_for_ssh_error(&SshError::Auth {
                user: "u".to_string(),
                remote: "b:22".to_string(),
                message: "credentials were not accepted".to_string(),
            }),
            ErrorKind::AuthFailed
        );
        assert_eq!(
            kind_for_ssh_error(&SshError::HostKeyUnknown {
                remote: "b:22".to_string(),
                fingerprint: "SHA256:abc".to_string(),
            }),
            ErrorKind::HostKeyMismatch
        );
        assert_eq!(kind_for_ssh_error(&SshError::Cancelled), ErrorKind::AuthRequired);
    }
}
