//! Host-key trust, checked synchronously against an OpenSSH-format
//! known_hosts file.  Policy comes from the config: an unknown key is
//! either recorded (trust-on-first-use, announced via
//! [`crate::SessionEvent::HostKeyRecorded`]) or refused; a key that
//! contradicts the file is always refused.

use crate::error::SshError;
use crate::session::SessionEvent;
use crate::transport::TransportTask;

impl TransportTask {
    pub(crate) fn verify_host_key(&self, sess: &ssh2::Session) -> Result<(), SshError> {
        let remote = self.config.remote_address();
        let file = self.config.known_hosts_file();

        let mut store = sess.known_hosts().map_err(SshError::transport)?;
        if file.exists() {
            store
                .read_file(&file, ssh2::KnownHostFileKind::OpenSSH)
                .map_err(|err| SshError::Transport {
                    message: format!("reading {}: {err}", file.display()),
                })?;
        } else if let Some(dir) = file.parent() {
            std::fs::create_dir_all(dir).map_err(SshError::transport)?;
        }

        let (key, key_type) = sess.host_key().ok_or_else(|| SshError::Transport {
            message: format!("{remote} presented no host key"),
        })?;
        let fingerprint = fingerprint_of(sess)?;

        match store.check_port(&self.config.hostname, self.config.port, key) {
            ssh2::CheckResult::Match => Ok(()),
            ssh2::CheckResult::NotFound => {
                if !self.config.trust_unknown_hosts {
                    return Err(SshError::HostKeyUnknown {
                        remote,
                        fingerprint,
                    });
                }

                // Non-default ports use the bracketed known_hosts form
                let entry_host = if self.config.port == 22 {
                    self.config.hostname.clone()
                } else {
                    format!("[{}]:{}", self.config.hostname, self.config.port)
                };
                store
                    .add(&entry_host, key, &remote, key_type.into())
                    .map_err(SshError::transport)?;
                store
                    .write_file(&file, ssh2::KnownHostFileKind::OpenSSH)
                    .map_err(|err| SshError::Transport {
                        message: format!("writing {}: {err}", file.display()),
                    })?;

                log::info!("recorded host key for {remote}: {fingerprint}");
                self.events
                    .try_send(SessionEvent::HostKeyRecorded {
                        fingerprint: fingerprint.clone(),
                    })
                    .ok();
                Ok(())
            }
            ssh2::CheckResult::Mismatch => Err(SshError::HostKeyMismatch {
                remote,
                fingerprint,
                file,
            }),
            ssh2::CheckResult::Failure => Err(SshError::Transport {
                message: "known_hosts lookup failed".to_string(),
            }),
        }
    }
}

/// Render the server key fingerprint the way ssh tooling prints it:
/// unpadded base64 of the sha256 digest, with a colon-hex sha1 form as
/// the fallback for ancient crypto libraries.
fn fingerprint_of(sess: &ssh2::Session) -> Result<String, SshError> {
    if let Some(digest) = sess.host_key_hash(ssh2::HashType::Sha256) {
        use base64::Engine;
        let engine = base64::engine::general_purpose::GeneralPurpose::new(
            &base64::alphabet::STANDARD,
            base64::engine::general_purpose::NO_PAD,
        );
        return Ok(format!("SHA256:{}", engine.encode(digest)));
    }
    if let Some(digest) = sess.host_key_hash(ssh2::HashType::Sha1) {
        let hex: Vec<String> = digest.iter().map(|b| format!("{b:02x}")).collect();
        return Ok(format!("SHA1:{}", hex.join(":")));
    }
    Err(SshError::Transport {
        message: "could not compute a host key fingerprint".to_string(),
    })
}
