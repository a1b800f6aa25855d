//! The public face of a transport.  A [`Session`] is a cheap handle
//! over the transport thread's request queue; every operation posts a
//! typed request and waits for a typed reply, so callers see real
//! [`SshError`]s instead of a silently dropped reply channel.
//!
//! Chain hops compose here: [`Session::connect_via`] turns a tunnel on
//! an existing transport into the byte stream a new transport
//! negotiates over, which is how a bastion chain is built one link at
//! a time.

use crate::auth::SecretPrompts;
use crate::config::{SessionConfig, Stream};
use crate::error::SshError;
use crate::pty::{OpenShell, RemoteChild, RemotePty, ResizeShell};
use crate::sftp::{FileOp, Sftp};
use crate::transport::{ChannelId, ListenerId, TransportTask};
use filedescriptor::{socketpair, FileDescriptor};
use parking_lot::Mutex;
use portable_pty::PtySize;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

#[derive(Debug)]
pub enum SessionEvent {
    Banner(Option<String>),
    /// Connection setup needs secret material (a password, a key
    /// passphrase, keyboard-interactive answers).  The consumer fills
    /// the prompts from its vault or from the user.
    NeedSecret(SecretPrompts),
    /// Trust-on-first-use recorded a new host key.
    HostKeyRecorded { fingerprint: String },
    /// Setup failed; the transport thread is gone.
    Failed(SshError),
    /// Authenticated and ready for channel traffic.
    Ready,
}

/// Wakes the transport thread out of its poll sleep when a request
/// lands on the queue.
pub(crate) struct Doorbell {
    pipe: Mutex<FileDescriptor>,
}

impl Doorbell {
    pub fn ring(&self) {
        let _ = self.pipe.lock().write(b"!");
    }
}

impl std::fmt::Debug for Doorbell {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "Doorbell")
    }
}

/// Posting side of the transport's request queue.  The queue is
/// unbounded so a post never blocks; the doorbell makes the thread
/// notice it promptly.
#[derive(Clone, Debug)]
pub(crate) struct RequestQueue {
    tx: flume::Sender<Request>,
    bell: Arc<Doorbell>,
}

impl RequestQueue {
    pub fn post(&self, req: Request) -> anyhow::Result<()> {
        self.tx
            .send(req)
            .map_err(|_| anyhow::anyhow!("transport thread is gone"))?;
        self.bell.ring();
        Ok(())
    }
}

pub(crate) enum Request {
    OpenShell(OpenShell),
    ResizeShell(ResizeShell),
    RunCommand(RunCommand),
    OpenTunnel(OpenTunnel),
    BindRemote(BindRemote),
    ReleaseBinding(ReleaseBinding),
    Probe(Probe),
    Hangup(Hangup),
    Files(FileOp),
}

pub(crate) struct RunCommand {
    pub command: String,
    pub env: Option<HashMap<String, String>>,
    pub reply: flume::Sender<Result<CommandStreams, SshError>>,
}

pub(crate) struct OpenTunnel {
    pub host: String,
    pub port: u16,
    pub reply: flume::Sender<Result<Tunnel, SshError>>,
}

pub(crate) struct BindRemote {
    pub bind_host: String,
    pub port: u16,
    pub announce: flume::Sender<Tunnel>,
    pub reply: flume::Sender<Result<(ListenerId, u16), SshError>>,
}

pub(crate) struct ReleaseBinding {
    pub listener_id: ListenerId,
    pub done: flume::Sender<()>,
}

pub(crate) struct Probe {
    pub reply: flume::Sender<Result<(), SshError>>,
}

pub(crate) struct Hangup {
    pub channel: ChannelId,
}

/// The near end of a direct-tcpip channel: one duplex descriptor
/// carrying the channel's bytes.  Dropping it hangs the channel up
/// once the transport drains what is pending.
#[derive(Debug)]
pub struct Tunnel {
    pub(crate) id: ChannelId,
    pub(crate) fd: FileDescriptor,
}

impl Tunnel {
    pub fn channel_id(&self) -> usize {
        self.id
    }

    /// Take the descriptor, e.g. to hand it to a splice task or to a
    /// nested transport.
    pub fn into_fd(self) -> FileDescriptor {
        self.fd
    }
}

/// Streams of a one-shot remote command: stdin/stdout share the duplex
/// descriptor, stderr has its own.
#[derive(Debug)]
pub struct CommandStreams {
    pub io: FileDescriptor,
    pub stderr: FileDescriptor,
    pub child: RemoteChild,
}

/// A remote-bind on the peer.  Announced inbound channels arrive on
/// `announced`; `release` withdraws the bind.
pub struct RemoteBinding {
    pub(crate) listener_id: ListenerId,
    pub bound_port: u16,
    pub announced: flume::Receiver<Tunnel>,
    pub(crate) queue: RequestQueue,
}

impl RemoteBinding {
    pub async fn release(self) -> anyhow::Result<()> {
        let (done, rx) = flume::bounded(1);
        self.queue.post(Request::ReleaseBinding(ReleaseBinding {
            listener_id: self.listener_id,
            done,
        }))?;
        rx.recv_async().await.ok();
        Ok(())
    }
}

#[derive(Clone)]
pub struct Session {
    queue: RequestQueue,
}

impl Session {
    /// Spawn the transport thread.  Setup progress (banner, secret
    /// prompts, host-key recording) streams from the event receiver;
    /// [`SessionEvent::Ready`] marks the transport open for channels
    /// and [`SessionEvent::Failed`] carries the typed reason when it
    /// is not.
    pub fn connect(config: SessionConfig) -> anyhow::Result<(Self, flume::Receiver<SessionEvent>)> {
        let (events_tx, events_rx) = flume::bounded(16);
        let (mut bell_write, mut bell_read) = socketpair()?;
        bell_write.set_non_blocking(true)?;
        bell_read.set_non_blocking(true)?;

        let (req_tx, req_rx) = flume::unbounded();
        let queue = RequestQueue {
            tx: req_tx,
            bell: Arc::new(Doorbell {
                pipe: Mutex::new(bell_write),
            }),
        };

        let thread_name = format!("ssh:{}", config.remote_address());
        let task = TransportTask::new(config, events_tx, req_rx, queue.clone(), bell_read);
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || task.run())?;

        Ok((Self { queue }, events_rx))
    }

    /// One hop of a bastion chain: open a tunnel on `parent` to the
    /// target's address, then negotiate a fresh transport over that
    /// tunnel's descriptor.
    pub async fn connect_via(
        parent: &Session,
        mut config: SessionConfig,
    ) -> anyhow::Result<(Self, flume::Receiver<SessionEvent>)> {
        let tunnel = parent
            .open_tunnel(&config.hostname, config.port)
            .await?;
        config.stream = Stream::Fd(tunnel.into_fd());
        Self::connect(config)
    }

    /// Interactive shell (or, with `command`, a command under a pty).
    pub async fn open_shell(
        &self,
        term: &str,
        dims: PtySize,
        command: Option<&str>,
    ) -> anyhow::Result<(RemotePty, RemoteChild)> {
        let (reply, rx) = flume::bounded(1);
        self.queue.post(Request::OpenShell(OpenShell {
            term: term.to_string(),
            dims,
            command: command.map(String::from),
            reply,
        }))?;
        Ok(rx.recv_async().await??)
    }

    /// Run a command without a pty; stdout rides the duplex stream,
    /// stderr separately.
    pub async fn run(
        &self,
        command: &str,
        env: Option<HashMap<String, String>>,
    ) -> anyhow::Result<CommandStreams> {
        let (reply, rx) = flume::bounded(1);
        self.queue.post(Request::RunCommand(RunCommand {
            command: command.to_string(),
            env,
            reply,
        }))?;
        Ok(rx.recv_async().await??)
    }

    /// Direct-tcpip channel to `host:port` as seen from the server;
    /// the building block for forwards, SOCKS connections and nested
    /// transports.
    pub async fn open_tunnel(&self, host: &str, port: u16) -> anyhow::Result<Tunnel> {
        let (reply, rx) = flume::bounded(1);
        self.queue.post(Request::OpenTunnel(OpenTunnel {
            host: host.to_string(),
            port,
            reply,
        }))?;
        Ok(rx.recv_async().await??)
    }

    /// Ask the peer to listen on `bind_host:port` and announce every
    /// inbound connection back to us.
    pub async fn bind_remote(&self, bind_host: &str, port: u16) -> anyhow::Result<RemoteBinding> {
        let (announce, announced) = flume::unbounded();
        let (reply, rx) = flume::bounded(1);
        self.queue.post(Request::BindRemote(BindRemote {
            bind_host: bind_host.to_string(),
            port,
            announce,
            reply,
        }))?;
        let (listener_id, bound_port) = rx.recv_async().await??;
        Ok(RemoteBinding {
            listener_id,
            bound_port,
            announced,
            queue: self.queue.clone(),
        })
    }

    /// One liveness probe.  An error means the transport could not
    /// carry it; silence accounting is the caller's job.
    pub async fn probe(&self) -> anyhow::Result<()> {
        let (reply, rx) = flume::bounded(1);
        self.queue.post(Request::Probe(Probe { reply }))?;
        rx.recv_async().await??;
        Ok(())
    }

    /// Tear down a single channel without touching the transport.
    pub fn hangup(&self, channel: usize) -> anyhow::Result<()> {
        self.queue.post(Request::Hangup(Hangup { channel }))
    }

    /// Filesystem handle; the sftp subsystem initializes lazily on the
    /// first operation.
    pub fn sftp(&self) -> Sftp {
        Sftp {
            queue: self.queue.clone(),
        }
    }
}
