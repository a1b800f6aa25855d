//! Authentication, driven by the node's configured method.  Secret
//! material never lives in the config; whenever the server wants some,
//! the transport raises [`SecretPrompts`] through the event stream and
//! blocks until the consumer answers from its vault or its user.

use crate::config::Auth;
use crate::error::SshError;
use crate::session::SessionEvent;
use crate::transport::TransportTask;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct Prompt {
    pub label: String,
    /// Whether the answer should be hidden while typed.
    pub masked: bool,
}

impl Prompt {
    fn secret(label: String) -> Self {
        Self {
            label,
            masked: true,
        }
    }
}

/// A batch of prompts raised during connection setup.  Answer every
/// prompt, in order; an empty answer set cancels authentication.
#[derive(Debug)]
pub struct SecretPrompts {
    pub user: String,
    /// Server-supplied instructions, when there are any.
    pub context: String,
    pub prompts: Vec<Prompt>,
    answers: flume::Sender<Vec<String>>,
}

impl SecretPrompts {
    pub fn respond(self, answers: Vec<String>) -> anyhow::Result<()> {
        self.answers
            .send(answers)
            .map_err(|_| anyhow::anyhow!("transport stopped waiting for the answer"))
    }

    pub async fn respond_async(self, answers: Vec<String>) -> anyhow::Result<()> {
        self.answers
            .send_async(answers)
            .await
            .map_err(|_| anyhow::anyhow!("transport stopped waiting for the answer"))
    }
}

impl TransportTask {
    /// Raise prompts and block this thread until they are answered.
    fn request_secret(
        &self,
        user: &str,
        context: &str,
        prompts: Vec<Prompt>,
    ) -> Result<Vec<String>, SshError> {
        let (answers, rx) = flume::bounded(1);
        self.events
            .send(SessionEvent::NeedSecret(SecretPrompts {
                user: user.to_string(),
                context: context.to_string(),
                prompts,
                answers,
            }))
            .map_err(|_| SshError::Cancelled)?;
        let answers = rx.recv().map_err(|_| SshError::Cancelled)?;
        if answers.is_empty() {
            return Err(SshError::Cancelled);
        }
        Ok(answers)
    }

    fn try_agent(&self, sess: &ssh2::Session, user: &str) -> bool {
        let mut agent = match sess.agent() {
            Ok(agent) => agent,
            Err(_) => return false,
        };
        if agent.connect().is_err() || agent.list_identities().is_err() {
            return false;
        }
        let identities = match agent.identities() {
            Ok(identities) => identities,
            Err(_) => return false,
        };
        identities
            .iter()
            .any(|identity| agent.userauth(user, identity).is_ok())
    }

    fn try_keyfile(
        &self,
        sess: &ssh2::Session,
        user: &str,
        key_path: &Path,
        cert_path: Option<&Path>,
    ) -> Result<bool, SshError> {
        if !key_path.exists() {
            return Err(SshError::Auth {
                user: user.to_string(),
                remote: self.config.remote_address(),
                message: format!("identity file {} does not exist", key_path.display()),
            });
        }

        // A certificate takes the public-key slot; otherwise offer the
        // sibling .pub when there is one.
        let pubkey: Option<PathBuf> = match cert_path {
            Some(cert) => Some(cert.to_path_buf()),
            None => {
                let sibling = PathBuf::from(format!("{}.pub", key_path.display()));
                sibling.exists().then_some(sibling)
            }
        };

        // First pass assumes the key is unencrypted
        if sess
            .userauth_pubkey_file(user, pubkey.as_deref(), key_path, None)
            .is_ok()
        {
            return Ok(true);
        }

        // Rejected: the usual reason is an encrypted key, so ask for
        // its passphrase and go again
        let answers = self.request_secret(
            user,
            "",
            vec![Prompt::secret(format!(
                "Passphrase for {}",
                key_path.display()
            ))],
        )?;
        match sess.userauth_pubkey_file(user, pubkey.as_deref(), key_path, Some(&answers[0])) {
            Ok(()) => Ok(true),
            Err(err) => {
                log::debug!("key file auth with passphrase: {err}");
                Ok(false)
            }
        }
    }

    fn try_password(&self, sess: &ssh2::Session, user: &str) -> Result<bool, SshError> {
        let remote = self.config.remote_address();
        let answers = self.request_secret(
            user,
            "",
            vec![Prompt::secret(format!("Password for {user}@{remote}"))],
        )?;
        match sess.userauth_password(user, &answers[0]) {
            Ok(()) => Ok(true),
            Err(err) => {
                log::debug!("password auth: {err}");
                Ok(false)
            }
        }
    }

    fn try_interactive(&self, sess: &ssh2::Session, user: &str) -> bool {
        // libssh2 calls back into the relay for each prompt round; the
        // relay blocks on the event consumer's answers.
        struct Relay<'a> {
            task: &'a TransportTask,
        }

        impl ssh2::KeyboardInteractivePrompt for Relay<'_> {
            fn prompt<'b>(
                &mut self,
                username: &str,
                instructions: &str,
                prompts: &[ssh2::Prompt<'b>],
            ) -> Vec<String> {
                let wanted = prompts
                    .iter()
                    .map(|p| Prompt {
                        label: p.text.to_string(),
                        masked: !p.echo,
                    })
                    .collect();
                // An empty answer set makes the server reject this
                // round, which is the only way to report cancellation
                // from inside the callback.
                self.task
                    .request_secret(username, instructions, wanted)
                    .unwrap_or_default()
            }
        }

        let mut relay = Relay { task: self };
        if let Err(err) = sess.userauth_keyboard_interactive(user, &mut relay) {
            log::debug!("keyboard-interactive auth: {err}");
        }
        sess.authenticated()
    }

    pub(crate) fn authenticate(&self, sess: &ssh2::Session) -> Result<(), SshError> {
        let user = self.config.user.clone();
        let remote = self.config.remote_address();
        let method = self.config.auth.clone();

        let reject = |message: String| SshError::Auth {
            user: user.clone(),
            remote: remote.clone(),
            message,
        };

        let mut rounds = 0;
        while !sess.authenticated() {
            if rounds >= 3 {
                return Err(reject(format!("gave up after {rounds} attempts")));
            }
            rounds += 1;

            // Ask again each round; a partial success (say, password
            // before a second factor) can change the offered set.
            let offered = sess
                .auth_methods(&user)
                .map_err(|err| reject(err.to_string()))?;
            log::trace!("server offers auth methods: {offered}");
            let offers = |name: &str| offered.split(',').any(|m| m == name);

            let accepted = match &method {
                Auth::Agent => {
                    if !offers("publickey") {
                        return Err(reject("server does not accept publickey auth".to_string()));
                    }
                    self.try_agent(sess, &user)
                }
                Auth::Key { key_path } => {
                    if !offers("publickey") {
                        return Err(reject("server does not accept publickey auth".to_string()));
                    }
                    self.try_keyfile(sess, &user, key_path, None)?
                }
                Auth::Certificate {
                    key_path,
                    cert_path,
                } => {
                    if !offers("publickey") {
                        return Err(reject("server does not accept publickey auth".to_string()));
                    }
                    self.try_keyfile(sess, &user, key_path, Some(cert_path))?
                }
                Auth::Password => {
                    if offers("password") {
                        self.try_password(sess, &user)?
                    } else if offers("keyboard-interactive") {
                        // Some servers only surface password prompts
                        // through the interactive method
                        self.try_interactive(sess, &user)
                    } else {
                        return Err(reject("server does not accept password auth".to_string()));
                    }
                }
                Auth::Interactive => {
                    if !offers("keyboard-interactive") {
                        return Err(reject(
                            "server does not accept keyboard-interactive auth".to_string(),
                        ));
                    }
                    self.try_interactive(sess, &user)
                }
            };

            if !accepted && !sess.authenticated() {
                return Err(reject(format!(
                    "{method:?} credentials were not accepted"
                )));
            }
        }
        Ok(())
    }
}
