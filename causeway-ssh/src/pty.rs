//! Handles for interactive shell channels.  A [`RemotePty`] is one
//! duplex descriptor bridged to the channel by the transport thread —
//! reads give the merged terminal output, writes feed the shell —
//! plus a resize that round-trips through the request queue.  The
//! paired [`RemoteChild`] reports the shell's exit.

use crate::error::SshError;
use crate::session::{Request, RequestQueue};
use crate::transport::ChannelId;
use anyhow::Context;
use filedescriptor::FileDescriptor;
use parking_lot::Mutex;
use portable_pty::{ExitStatus, PtySize};
use std::io::{Read, Write};

pub(crate) struct OpenShell {
    pub term: String,
    pub dims: PtySize,
    /// Run this instead of the login shell.
    pub command: Option<String>,
    pub reply: flume::Sender<Result<(RemotePty, RemoteChild), SshError>>,
}

pub(crate) struct ResizeShell {
    pub channel: ChannelId,
    pub dims: PtySize,
    pub done: flume::Sender<Result<(), SshError>>,
}

#[derive(Debug)]
pub struct RemotePty {
    channel: ChannelId,
    io: FileDescriptor,
    dims: Mutex<PtySize>,
    queue: RequestQueue,
}

impl RemotePty {
    pub(crate) fn new(
        channel: ChannelId,
        io: FileDescriptor,
        dims: PtySize,
        queue: RequestQueue,
    ) -> Self {
        Self {
            channel,
            io,
            dims: Mutex::new(dims),
            queue,
        }
    }

    pub fn channel_id(&self) -> usize {
        self.channel
    }

    pub fn dims(&self) -> PtySize {
        *self.dims.lock()
    }

    /// Propagate a window-size change to the remote pty.  Blocks for
    /// the transport's acknowledgement, so call it off the async
    /// executor.
    pub fn resize(&self, dims: PtySize) -> anyhow::Result<()> {
        let (done, rx) = flume::bounded(1);
        self.queue.post(Request::ResizeShell(ResizeShell {
            channel: self.channel,
            dims,
            done,
        }))?;
        rx.recv()
            .context("transport went away mid-resize")??;
        *self.dims.lock() = dims;
        Ok(())
    }

    /// Both directions ride the same descriptor; reader and writer are
    /// clones of it.
    pub fn clone_reader(&self) -> anyhow::Result<Box<dyn Read + Send + 'static>> {
        Ok(Box::new(self.io.try_clone()?))
    }

    pub fn clone_writer(&self) -> anyhow::Result<Box<dyn Write + Send + 'static>> {
        Ok(Box::new(self.io.try_clone()?))
    }
}

#[derive(Debug)]
pub struct RemoteChild {
    channel: ChannelId,
    exit: flume::Receiver<ExitStatus>,
    seen: Option<ExitStatus>,
    queue: RequestQueue,
}

impl RemoteChild {
    pub(crate) fn new(
        channel: ChannelId,
        exit: flume::Receiver<ExitStatus>,
        queue: RequestQueue,
    ) -> Self {
        Self {
            channel,
            exit,
            seen: None,
            queue,
        }
    }

    pub fn channel_id(&self) -> usize {
        self.channel
    }

    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        if let Some(status) = &self.seen {
            return Some(status.clone());
        }
        let status = match self.exit.try_recv() {
            Ok(status) => status,
            Err(flume::TryRecvError::Empty) => return None,
            // The transport died before reporting; call that a failure
            Err(flume::TryRecvError::Disconnected) => ExitStatus::with_exit_code(1),
        };
        self.seen = Some(status.clone());
        Some(status)
    }

    pub async fn wait(&mut self) -> ExitStatus {
        if let Some(status) = &self.seen {
            return status.clone();
        }
        let status = self
            .exit
            .recv_async()
            .await
            .unwrap_or_else(|_| ExitStatus::with_exit_code(1));
        self.seen = Some(status.clone());
        status
    }

    /// Drop the channel out from under the shell.  libssh2 cannot
    /// deliver signals, so hanging up is the only lever.
    pub fn hangup(&mut self) -> anyhow::Result<()> {
        self.queue.post(Request::Hangup(crate::session::Hangup {
            channel: self.channel,
        }))
    }
}
