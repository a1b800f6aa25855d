//! The transport thread.  One per connection: it owns the libssh2
//! session and every channel on it, since neither is safe to touch
//! from two threads.
//!
//! The thread alternates between two activities.  A *sweep* moves
//! whatever bytes can move without blocking: every channel pump runs,
//! exit statuses are delivered, remote bindings are polled for
//! announced channels, and queued requests are executed.  Between
//! sweeps the thread parks in `poll(2)` over the doorbell, the
//! transport socket and the bridge descriptors, with a short timeout
//! while traffic is flowing and a long one when idle.
//!
//! Channels are bridged to the rest of the process through a duplex
//! socketpair: the consumer holds the far end, the pump here owns the
//! near end plus a small pending buffer per direction (a [`Lane`]).

use crate::config::{SessionConfig, Stream};
use crate::error::SshError;
use crate::pty::{OpenShell, RemoteChild, RemotePty, ResizeShell};
use crate::session::{
    BindRemote, CommandStreams, OpenTunnel, Request, RequestQueue, RunCommand, SessionEvent,
    Tunnel,
};
use anyhow::Context;
use filedescriptor::{
    poll, pollfd, socketpair, AsRawSocketDescriptor, FileDescriptor, POLLIN, POLLOUT,
};
use portable_pty::ExitStatus;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

pub(crate) type ChannelId = usize;
pub(crate) type FileId = usize;
pub(crate) type ListenerId = usize;

/// Upper bound on bytes parked in one lane.
const LANE_CAP: usize = 8 * 1024;

/// Poll timeout while bytes were moving on the last sweep.
const POLL_BUSY: Duration = Duration::from_millis(25);
/// Poll timeout when the last sweep found nothing to do.
const POLL_IDLE: Duration = Duration::from_secs(1);

/// libssh2's EAGAIN; what a non-blocking accept reports when nothing
/// is pending.
const ERR_EAGAIN: i32 = -37;

enum LaneIo {
    Idle,
    Moved,
    Closed,
}

/// One direction of a channel bridge: a socketpair end plus the bytes
/// waiting to cross it.
struct Lane {
    fd: FileDescriptor,
    pending: Vec<u8>,
    eof: bool,
}

impl Lane {
    fn new(fd: FileDescriptor) -> Self {
        Self {
            fd,
            pending: Vec::new(),
            eof: false,
        }
    }
}

/// Fill `pending` from a non-blocking reader, up to the lane cap.
fn pull<R: Read>(source: &mut R, pending: &mut Vec<u8>) -> LaneIo {
    let mut scratch = [0u8; 4096];
    let mut outcome = LaneIo::Idle;
    while pending.len() < LANE_CAP {
        match source.read(&mut scratch) {
            Ok(0) => return LaneIo::Closed,
            Ok(n) => {
                pending.extend_from_slice(&scratch[..n]);
                outcome = LaneIo::Moved;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return LaneIo::Closed,
        }
    }
    outcome
}

/// Drain `pending` into a non-blocking writer.
fn push<W: Write>(sink: &mut W, pending: &mut Vec<u8>) -> LaneIo {
    let mut outcome = LaneIo::Idle;
    while !pending.is_empty() {
        match sink.write(pending) {
            Ok(0) => return LaneIo::Closed,
            Ok(n) => {
                pending.drain(..n);
                outcome = LaneIo::Moved;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return LaneIo::Closed,
        }
    }
    outcome
}

/// A live channel and its bridge.  `feed` carries consumer bytes into
/// the channel; `drain` carries channel output out; `errs` exists only
/// for command channels that keep stderr separate.
struct ChannelPump {
    id: ChannelId,
    channel: ssh2::Channel,
    exit_tx: Option<flume::Sender<ExitStatus>>,
    feed: Option<Lane>,
    drain: Option<Lane>,
    errs: Option<Lane>,
}

impl ChannelPump {
    /// Move whatever can move in both directions.  Returns whether any
    /// bytes crossed, so the service loop can pick its poll timeout.
    fn pump(&mut self) -> bool {
        let mut moved = false;

        // Consumer -> channel.  The consumer dropping its end reads as
        // EOF here; we finish flushing and then hang the channel up.
        let mut consumer_gone = false;
        if let Some(lane) = self.feed.as_mut() {
            if !lane.eof {
                match pull(&mut lane.fd, &mut lane.pending) {
                    LaneIo::Moved => moved = true,
                    LaneIo::Closed => lane.eof = true,
                    LaneIo::Idle => {}
                }
            }
            match push(&mut self.channel, &mut lane.pending) {
                LaneIo::Moved => moved = true,
                LaneIo::Closed => {
                    lane.eof = true;
                    lane.pending.clear();
                }
                LaneIo::Idle => {}
            }
            if lane.eof && lane.pending.is_empty() {
                consumer_gone = true;
            }
        }
        if consumer_gone {
            self.feed = None;
            self.channel.close().ok();
            moved = true;
        }

        // Channel -> consumer, stdout then stderr.
        moved |= drain_stream(&mut self.channel, 0, &mut self.drain);
        moved |= drain_stream(&mut self.channel, 1, &mut self.errs);

        moved
    }

    fn is_spent(&self) -> bool {
        self.exit_tx.is_none() && self.feed.is_none() && self.drain.is_none() && self.errs.is_none()
    }
}

fn drain_stream(channel: &mut ssh2::Channel, stream_id: i32, slot: &mut Option<Lane>) -> bool {
    let mut moved = false;
    let mut finished = false;
    if let Some(lane) = slot.as_mut() {
        if !lane.eof {
            match pull(&mut channel.stream(stream_id), &mut lane.pending) {
                LaneIo::Moved => moved = true,
                LaneIo::Closed => lane.eof = true,
                LaneIo::Idle => {}
            }
        }
        let flushed = {
            let Lane { fd, pending, .. } = &mut *lane;
            push(fd, pending)
        };
        match flushed {
            LaneIo::Moved => moved = true,
            LaneIo::Closed => {
                lane.eof = true;
                lane.pending.clear();
            }
            LaneIo::Idle => {}
        }
        if lane.eof && lane.pending.is_empty() {
            finished = true;
        }
    }
    if finished {
        *slot = None;
        moved = true;
    }
    moved
}

fn exit_status_of(channel: &mut ssh2::Channel) -> Option<ExitStatus> {
    if !channel.eof() {
        return None;
    }
    channel.wait_close().ok()?;
    let killed = channel
        .exit_signal()
        .ok()
        .map(|sig| sig.exit_signal.is_some())
        .unwrap_or(false);
    if killed {
        return Some(ExitStatus::with_exit_code(1));
    }
    channel
        .exit_status()
        .ok()
        .map(|code| ExitStatus::with_exit_code(code as u32))
}

struct BindingSlot {
    listener: ssh2::Listener,
    announce: flume::Sender<Tunnel>,
}

pub(crate) struct TransportTask {
    pub(crate) config: SessionConfig,
    pub(crate) events: flume::Sender<SessionEvent>,
    requests: flume::Receiver<Request>,
    /// Handle to our own queue, baked into the pty/child handles we
    /// hand out so they can post resize/hangup requests.
    queue: RequestQueue,
    bell: FileDescriptor,
    pumps: HashMap<ChannelId, ChannelPump>,
    bindings: HashMap<ListenerId, BindingSlot>,
    pub(crate) files: HashMap<FileId, ssh2::File>,
    pub(crate) sftp: Option<ssh2::Sftp>,
    next_channel_id: ChannelId,
    next_listener_id: ListenerId,
    pub(crate) next_file_id: FileId,
}

impl TransportTask {
    pub fn new(
        config: SessionConfig,
        events: flume::Sender<SessionEvent>,
        requests: flume::Receiver<Request>,
        queue: RequestQueue,
        bell: FileDescriptor,
    ) -> Self {
        Self {
            config,
            events,
            requests,
            queue,
            bell,
            pumps: HashMap::new(),
            bindings: HashMap::new(),
            files: HashMap::new(),
            sftp: None,
            next_channel_id: 1,
            next_listener_id: 1,
            next_file_id: 1,
        }
    }

    pub fn run(mut self) {
        if let Err(err) = self.run_transport() {
            log::debug!(
                "transport for {} ended: {err}",
                self.config.remote_address()
            );
            self.events.try_send(SessionEvent::Failed(err)).ok();
        }
    }

    fn run_transport(&mut self) -> Result<(), SshError> {
        let remote = self.config.remote_address();

        let stream = self.establish_stream()?;
        let mut sess = ssh2::Session::new().map_err(SshError::transport)?;
        sess.set_blocking(true);
        sess.set_tcp_stream(stream);
        sess.handshake().map_err(|err| SshError::Handshake {
            remote: remote.clone(),
            message: err.to_string(),
        })?;

        self.events
            .try_send(SessionEvent::Banner(sess.banner().map(|s| s.to_string())))
            .ok();

        self.verify_host_key(&sess)?;
        self.authenticate(&sess)?;

        self.events.try_send(SessionEvent::Ready).ok();

        // want_reply makes the peer confirm our probes, so a silently
        // dead link turns into an error on the next probe request.
        sess.set_keepalive(true, self.config.keepalive_interval.as_secs() as u32);

        sess.set_blocking(false);
        self.service_loop(&mut sess)
            .map_err(|err| SshError::transport(err))
    }

    fn establish_stream(&mut self) -> Result<TcpStream, SshError> {
        let remote = self.config.remote_address();
        match std::mem::replace(&mut self.config.stream, Stream::Tcp) {
            Stream::Fd(fd) => {
                // Typically the near end of a tunnel through a parent
                // transport.  libssh2 only needs something it can
                // send()/recv() on, so any connected descriptor works.
                #[cfg(unix)]
                unsafe {
                    use std::os::unix::io::{FromRawFd, IntoRawFd};
                    Ok(TcpStream::from_raw_fd(fd.into_raw_fd()))
                }
                #[cfg(windows)]
                unsafe {
                    use std::os::windows::io::{FromRawSocket, IntoRawSocket};
                    Ok(TcpStream::from_raw_socket(fd.into_raw_socket()))
                }
            }
            Stream::Tcp => {
                use std::net::ToSocketAddrs;
                let addr = (self.config.hostname.as_str(), self.config.port)
                    .to_socket_addrs()
                    .map_err(|err| SshError::Connect {
                        remote: remote.clone(),
                        message: format!("resolving: {err}"),
                    })?
                    .next()
                    .ok_or_else(|| SshError::Connect {
                        remote: remote.clone(),
                        message: "name resolved to no addresses".to_string(),
                    })?;
                let socket = TcpStream::connect_timeout(&addr, self.config.connect_timeout)
                    .map_err(|err| SshError::Connect {
                        remote: remote.clone(),
                        message: err.to_string(),
                    })?;
                socket.set_nodelay(true).map_err(SshError::transport)?;
                Ok(socket)
            }
        }
    }

    // ----- the sweep/park loop ---------------------------------------

    fn service_loop(&mut self, sess: &mut ssh2::Session) -> anyhow::Result<()> {
        loop {
            let mut busy = false;
            for pump in self.pumps.values_mut() {
                busy |= pump.pump();
            }
            busy |= self.settle_pumps();
            busy |= self.harvest_bindings();
            busy |= self.take_requests(sess)?;

            let wait = if busy { POLL_BUSY } else { POLL_IDLE };
            self.park(sess, wait)?;
        }
    }

    /// Deliver exit statuses, propagate output-side EOF to consumers,
    /// and forget pumps with nothing left to do.
    fn settle_pumps(&mut self) -> bool {
        let mut moved = false;
        let mut spent = vec![];
        for pump in self.pumps.values_mut() {
            if let Some(tx) = pump.exit_tx.as_ref() {
                if let Some(status) = exit_status_of(&mut pump.channel) {
                    tx.try_send(status).ok();
                    pump.exit_tx = None;
                    moved = true;
                }
            }
            // Every output lane is finished: hang up our side of the
            // bridge so the consumer reads EOF instead of waiting.
            if pump.drain.is_none() && pump.errs.is_none() && pump.feed.is_some() {
                pump.feed = None;
                pump.channel.close().ok();
                moved = true;
            }
            if pump.is_spent() {
                spent.push(pump.id);
            }
        }
        for id in spent {
            log::trace!("channel {} is spent", id);
            self.pumps.remove(&id);
        }
        moved
    }

    /// Non-blocking accept pass over the remote bindings.
    fn harvest_bindings(&mut self) -> bool {
        let mut moved = false;
        let mut inbound = vec![];
        let mut dead = vec![];
        for (listener_id, slot) in self.bindings.iter_mut() {
            match slot.listener.accept() {
                Ok(channel) => inbound.push((*listener_id, channel)),
                Err(err) if err.code() == ssh2::ErrorCode::Session(ERR_EAGAIN) => {}
                Err(err) => {
                    log::debug!("remote binding {listener_id}: {err}");
                    dead.push(*listener_id);
                }
            }
        }
        for listener_id in dead {
            self.bindings.remove(&listener_id);
        }
        for (listener_id, channel) in inbound {
            moved = true;
            match self.bridge(channel, None, false) {
                Ok((tunnel, _)) => {
                    let still_wanted = self
                        .bindings
                        .get(&listener_id)
                        .map(|slot| slot.announce.try_send(tunnel).is_ok())
                        .unwrap_or(false);
                    if !still_wanted {
                        log::debug!("binding {listener_id} has no consumer; dropping it");
                        self.bindings.remove(&listener_id);
                    }
                }
                Err(err) => log::error!("bridging announced channel: {err:#}"),
            }
        }
        moved
    }

    fn take_requests(&mut self, sess: &mut ssh2::Session) -> anyhow::Result<bool> {
        let mut handled = false;
        loop {
            match self.requests.try_recv() {
                Ok(req) => {
                    handled = true;
                    // Requests run with the session blocking so libssh2
                    // completes each lifecycle operation in one call;
                    // lifecycle ops on one connection serialize here.
                    sess.set_blocking(true);
                    self.handle_request(sess, req);
                    sess.set_blocking(false);
                }
                Err(flume::TryRecvError::Empty) => return Ok(handled),
                Err(flume::TryRecvError::Disconnected) => {
                    anyhow::bail!("every session handle is gone; closing transport")
                }
            }
        }
    }

    /// Park in poll(2) until the doorbell rings, the transport socket
    /// has traffic, a consumer wrote into a feed lane, or a lane with
    /// pending bytes can flush.
    fn park(&mut self, sess: &ssh2::Session, wait: Duration) -> anyhow::Result<()> {
        let mut fds = vec![
            pollfd {
                fd: self.bell.as_socket_descriptor(),
                events: POLLIN,
                revents: 0,
            },
            pollfd {
                fd: sess.as_socket_descriptor(),
                events: match sess.block_directions() {
                    ssh2::BlockDirections::None => 0,
                    ssh2::BlockDirections::Inbound => POLLIN,
                    ssh2::BlockDirections::Outbound => POLLOUT,
                    ssh2::BlockDirections::Both => POLLIN | POLLOUT,
                },
                revents: 0,
            },
        ];

        for pump in self.pumps.values() {
            if let Some(lane) = &pump.feed {
                if !lane.eof {
                    fds.push(pollfd {
                        fd: lane.fd.as_socket_descriptor(),
                        events: POLLIN,
                        revents: 0,
                    });
                }
            }
            for lane in [pump.drain.as_ref(), pump.errs.as_ref()].into_iter().flatten() {
                if !lane.pending.is_empty() {
                    fds.push(pollfd {
                        fd: lane.fd.as_socket_descriptor(),
                        events: POLLOUT,
                        revents: 0,
                    });
                }
            }
        }

        poll(&mut fds, Some(wait)).context("waiting for transport readiness")?;

        // Swallow doorbell rings; the next sweep picks the work up.
        let mut scratch = [0u8; 32];
        let _ = self.bell.read(&mut scratch);
        Ok(())
    }

    // ----- request execution -----------------------------------------

    fn handle_request(&mut self, sess: &mut ssh2::Session, req: Request) {
        match req {
            Request::OpenShell(op) => {
                let result = self.open_shell(sess, &op).map_err(SshError::transport);
                op.reply.try_send(result).ok();
            }
            Request::ResizeShell(op) => {
                let result = self.resize_shell(&op).map_err(SshError::transport);
                op.done.try_send(result).ok();
            }
            Request::RunCommand(op) => {
                let result = self.run_command(sess, &op).map_err(SshError::transport);
                op.reply.try_send(result).ok();
            }
            Request::OpenTunnel(op) => {
                let result = self.open_tunnel(sess, &op).map_err(SshError::transport);
                op.reply.try_send(result).ok();
            }
            Request::BindRemote(op) => {
                let result = self.bind_remote(sess, &op).map_err(SshError::transport);
                op.reply.try_send(result).ok();
            }
            Request::ReleaseBinding(op) => {
                self.bindings.remove(&op.listener_id);
                op.done.try_send(()).ok();
            }
            Request::Probe(op) => {
                let result = sess
                    .keepalive_send()
                    .map(|_next| ())
                    .map_err(|err| SshError::Transport {
                        message: format!("keepalive: {err}"),
                    });
                op.reply.try_send(result).ok();
            }
            Request::Hangup(op) => {
                if let Some(mut pump) = self.pumps.remove(&op.channel) {
                    pump.channel.close().ok();
                }
            }
            Request::Files(op) => self.handle_file_op(sess, op),
        }
    }

    fn open_shell(
        &mut self,
        sess: &mut ssh2::Session,
        op: &OpenShell,
    ) -> anyhow::Result<(RemotePty, RemoteChild)> {
        let mut channel = sess.channel_session().context("opening shell channel")?;

        // Interactive output is one stream to the renderer
        channel.handle_extended_data(ssh2::ExtendedData::Merge)?;
        channel.request_pty(
            &op.term,
            None,
            Some((
                op.dims.cols.into(),
                op.dims.rows.into(),
                op.dims.pixel_width.into(),
                op.dims.pixel_height.into(),
            )),
        )?;
        match &op.command {
            Some(command) => channel.exec(command)?,
            None => channel.shell()?,
        }

        let (exit_tx, exit_rx) = flume::bounded(1);
        let (tunnel, _) = self.bridge(channel, Some(exit_tx), false)?;
        let Tunnel { id, fd } = tunnel;

        Ok((
            RemotePty::new(id, fd, op.dims, self.queue.clone()),
            RemoteChild::new(id, exit_rx, self.queue.clone()),
        ))
    }

    fn resize_shell(&mut self, op: &ResizeShell) -> anyhow::Result<()> {
        let pump = self
            .pumps
            .get_mut(&op.channel)
            .ok_or_else(|| anyhow::anyhow!("no such channel {}", op.channel))?;
        pump.channel.request_pty_size(
            op.dims.cols.into(),
            op.dims.rows.into(),
            Some(op.dims.pixel_width.into()),
            Some(op.dims.pixel_height.into()),
        )?;
        Ok(())
    }

    fn run_command(
        &mut self,
        sess: &mut ssh2::Session,
        op: &RunCommand,
    ) -> anyhow::Result<CommandStreams> {
        let mut channel = sess.channel_session().context("opening command channel")?;

        if let Some(env) = &op.env {
            for (key, value) in env {
                if let Err(err) = channel.setenv(key, value) {
                    // Servers commonly reject env names outside their
                    // AcceptEnv list; the command itself still runs.
                    log::warn!("setenv {key} rejected by server: {err}");
                }
            }
        }
        channel.exec(&op.command)?;

        let (exit_tx, exit_rx) = flume::bounded(1);
        let (tunnel, stderr) = self.bridge(channel, Some(exit_tx), true)?;
        let Tunnel { id, fd } = tunnel;

        Ok(CommandStreams {
            io: fd,
            stderr: stderr.expect("stderr lane was requested"),
            child: RemoteChild::new(id, exit_rx, self.queue.clone()),
        })
    }

    fn open_tunnel(&mut self, sess: &mut ssh2::Session, op: &OpenTunnel) -> anyhow::Result<Tunnel> {
        let channel = sess
            .channel_direct_tcpip(&op.host, op.port, None)
            .with_context(|| format!("direct-tcpip to {}:{}", op.host, op.port))?;
        let (tunnel, _) = self.bridge(channel, None, false)?;
        Ok(tunnel)
    }

    fn bind_remote(
        &mut self,
        sess: &mut ssh2::Session,
        op: &BindRemote,
    ) -> anyhow::Result<(ListenerId, u16)> {
        let (listener, bound_port) = sess
            .channel_forward_listen(op.port, Some(&op.bind_host), None)
            .with_context(|| format!("remote bind on {}:{}", op.bind_host, op.port))?;
        let listener_id = self.next_listener_id;
        self.next_listener_id += 1;
        self.bindings.insert(
            listener_id,
            BindingSlot {
                listener,
                announce: op.announce.clone(),
            },
        );
        Ok((listener_id, bound_port))
    }

    /// Wire a channel into the pump table.  The consumer receives the
    /// far end of a duplex socketpair; with `want_stderr` a second
    /// pair carries the channel's stderr stream.
    fn bridge(
        &mut self,
        channel: ssh2::Channel,
        exit_tx: Option<flume::Sender<ExitStatus>>,
        want_stderr: bool,
    ) -> anyhow::Result<(Tunnel, Option<FileDescriptor>)> {
        let id = self.next_channel_id;
        self.next_channel_id += 1;

        let (far, mut near) = socketpair()?;
        near.set_non_blocking(true)?;
        let near_out = near.try_clone()?;

        let (errs, far_err) = if want_stderr {
            let (far_err, mut near_err) = socketpair()?;
            near_err.set_non_blocking(true)?;
            (Some(Lane::new(near_err)), Some(far_err))
        } else {
            (None, None)
        };

        self.pumps.insert(
            id,
            ChannelPump {
                id,
                channel,
                exit_tx,
                feed: Some(Lane::new(near)),
                drain: Some(Lane::new(near_out)),
                errs,
            },
        );

        Ok((Tunnel { id, fd: far }, far_err))
    }
}
