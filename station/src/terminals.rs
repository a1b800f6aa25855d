//! Terminal sessions over SSH channels.  A session owns exactly one
//! channel at a time; on link-down it keeps its scrollback, size and
//! wire endpoint and waits for the orchestrator to hand it a fresh
//! channel.  Only the channel handle is ever swapped.

use crate::config::CoreConfig;
use crate::dependents::{DependentKey, DependentKind, DependentState};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::node::NodeId;
use crate::scrollback::ScrollbackRing;
use crate::util;
use crate::{Station, StationNotification};
use causeway_ssh::{RemoteChild, RemotePty};
use parking_lot::{Mutex, RwLock};
use portable_pty::PtySize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wire::Frame;

pub type TerminalId = usize;

static TERMINAL_ID: AtomicUsize = AtomicUsize::new(1);

pub fn alloc_terminal_id() -> TerminalId {
    TERMINAL_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Streaming,
    AwaitingReattach,
    Closed,
}

pub struct TerminalSession {
    pub terminal_id: TerminalId,
    pub node_id: NodeId,
    size: Mutex<PtySize>,
    pub scrollback: Mutex<ScrollbackRing>,
    state: Mutex<TerminalState>,
    pty: Mutex<Option<RemotePty>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Option<RemoteChild>>,
    endpoint: Mutex<Option<flume::Sender<Frame>>>,
    /// Bumped on rebind so a superseded reader thread stands down.
    reader_epoch: AtomicUsize,
}

impl TerminalSession {
    pub fn state(&self) -> TerminalState {
        *self.state.lock()
    }

    pub fn size(&self) -> PtySize {
        *self.size.lock()
    }

    fn current_epoch(&self) -> usize {
        self.reader_epoch.load(Ordering::SeqCst)
    }
}

pub struct TerminalRegistry {
    terminals: RwLock<HashMap<TerminalId, Arc<TerminalSession>>>,
    scrollback_bytes: usize,
    channel_open_timeout: Duration,
}

impl TerminalRegistry {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            terminals: RwLock::new(HashMap::new()),
            scrollback_bytes: config.scrollback_bytes,
            channel_open_timeout: config.channel_open_timeout(),
        }
    }

    pub fn get(&self, terminal_id: TerminalId) -> CoreResult<Arc<TerminalSession>> {
        self.terminals
            .read()
            .get(&terminal_id)
            .map(Arc::clone)
            .ok_or_else(|| CoreError::not_found(format!("terminal {terminal_id}")))
    }

    pub fn list(&self) -> Vec<(TerminalId, NodeId)> {
        self.terminals
            .read()
            .values()
            .map(|t| (t.terminal_id, t.node_id.clone()))
            .collect()
    }

    pub fn for_node(&self, node_id: &str) -> Vec<Arc<TerminalSession>> {
        self.terminals
            .read()
            .values()
            .filter(|t| t.node_id == node_id)
            .map(Arc::clone)
            .collect()
    }

    pub async fn open(
        &self,
        station: &Arc<Station>,
        node_id: &str,
        rows: u16,
        cols: u16,
    ) -> CoreResult<TerminalId> {
        let record = station.resolve_connection(node_id).await?;
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let (pty, child) = util::timeout(self.channel_open_timeout, "terminal channel open", async {
            record
                .session
                .open_shell("xterm-256color", size, None)
                .await
                .map_err(Into::into)
        })
        .await?;

        let terminal_id = alloc_terminal_id();
        let reader = pty.clone_reader().map_err(CoreError::internal)?;
        let writer = pty.clone_writer().map_err(CoreError::internal)?;

        let session = Arc::new(TerminalSession {
            terminal_id,
            node_id: node_id.to_string(),
            size: Mutex::new(size),
            scrollback: Mutex::new(ScrollbackRing::new(self.scrollback_bytes)),
            state: Mutex::new(TerminalState::Streaming),
            pty: Mutex::new(Some(pty)),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(Some(child)),
            endpoint: Mutex::new(None),
            reader_epoch: AtomicUsize::new(0),
        });

        self.terminals
            .write()
            .insert(terminal_id, Arc::clone(&session));
        station.register_dependent(
            DependentKey::new(DependentKind::Terminal, terminal_id),
            node_id,
        )?;
        station.with_runtime(node_id, |runtime| {
            runtime.terminals.insert(terminal_id);
        })?;

        spawn_reader(Arc::clone(&session), reader, 0);

        let generation = station
            .with_runtime(node_id, |runtime| runtime.next_generation())
            .unwrap_or(0);
        station.notify(StationNotification::TerminalAttached {
            node_id: node_id.to_string(),
            terminal_id,
            generation,
        });
        Ok(terminal_id)
    }

    /// Input bytes from the UI peer; ordered delivery is guaranteed by
    /// the single writer handle per session.
    pub fn write(&self, terminal_id: TerminalId, data: &[u8]) -> CoreResult<()> {
        let session = self.get(terminal_id)?;
        let mut writer = session.writer.lock();
        match writer.as_mut() {
            Some(w) => w.write_all(data).map_err(|err| {
                CoreError::new(
                    ErrorKind::Transient,
                    format!("terminal {terminal_id} write: {err}"),
                )
            }),
            None => Err(CoreError::new(
                ErrorKind::BusyRetryLater,
                format!("terminal {terminal_id} is awaiting reattach"),
            )
            .with_tag("AWAITING_REATTACH")),
        }
    }

    pub async fn resize(&self, terminal_id: TerminalId, rows: u16, cols: u16) -> CoreResult<()> {
        let session = self.get(terminal_id)?;
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        *session.size.lock() = size;

        // The resize round-trips through the transport thread; keep the
        // executor free while it does.
        let session = Arc::clone(&session);
        smol::unblock(move || {
            let pty = session.pty.lock();
            match pty.as_ref() {
                Some(pty) => pty.resize(size).map_err(CoreError::internal),
                // Size is recorded; the orchestrator re-applies it on
                // restore.
                None => Ok(()),
            }
        })
        .await
    }

    pub async fn close(&self, station: &Arc<Station>, terminal_id: TerminalId) -> CoreResult<()> {
        let session = self.get(terminal_id)?;
        *session.state.lock() = TerminalState::Closed;
        session.reader_epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(mut child) = session.child.lock().take() {
            child.hangup().ok();
        }
        session.pty.lock().take();
        session.writer.lock().take();
        session.endpoint.lock().take();

        self.remove(station, &session);
        Ok(())
    }

    fn remove(&self, station: &Arc<Station>, session: &Arc<TerminalSession>) {
        self.terminals.write().remove(&session.terminal_id);
        station.unregister_dependent(&DependentKey::new(
            DependentKind::Terminal,
            session.terminal_id,
        ));
        let _ = station.with_runtime(&session.node_id, |runtime| {
            runtime.terminals.remove(&session.terminal_id);
        });
        let generation = station
            .with_runtime(&session.node_id, |runtime| runtime.next_generation())
            .unwrap_or(0);
        station.notify(StationNotification::TerminalDetached {
            node_id: session.node_id.clone(),
            terminal_id: session.terminal_id,
            generation,
        });
    }

    /// Bind the single UI peer.  Returns the frame stream plus a
    /// scrollback snapshot the endpoint should replay first.
    pub fn attach_endpoint(
        &self,
        terminal_id: TerminalId,
    ) -> CoreResult<(flume::Receiver<Frame>, Vec<u8>)> {
        let session = self.get(terminal_id)?;
        let mut endpoint = session.endpoint.lock();
        if endpoint.is_some() {
            return Err(CoreError::new(
                ErrorKind::AlreadyExists,
                format!("terminal {terminal_id} already has a bound peer"),
            ));
        }
        let (tx, rx) = flume::unbounded();
        endpoint.replace(tx);
        let snapshot = session.scrollback.lock().snapshot();
        Ok((rx, snapshot))
    }

    pub fn detach_endpoint(&self, terminal_id: TerminalId) {
        if let Ok(session) = self.get(terminal_id) {
            session.endpoint.lock().take();
        }
    }

    /// Link-down: every session on the node parks, keeping scrollback,
    /// size and endpoint.  The dead channel handles are dropped.
    pub fn mark_node_awaiting_reattach(&self, station: &Arc<Station>, node_id: &str) {
        for session in self.for_node(node_id) {
            if session.state() != TerminalState::Streaming {
                continue;
            }
            *session.state.lock() = TerminalState::AwaitingReattach;
            session.reader_epoch.fetch_add(1, Ordering::SeqCst);
            session.pty.lock().take();
            session.writer.lock().take();
            session.child.lock().take();
            station.dependents.lock().set_state(
                &DependentKey::new(DependentKind::Terminal, session.terminal_id),
                DependentState::AwaitingReattach,
            );
        }
    }

    /// Restore phase: give each parked session a fresh channel with its
    /// preserved dimensions.  A failure on one session does not stop
    /// the others; failed sessions are marked errored and reported.
    pub async fn restore_node(
        &self,
        station: &Arc<Station>,
        node_id: &str,
    ) -> Vec<(TerminalId, CoreResult<()>)> {
        let mut results = vec![];
        for session in self.for_node(node_id) {
            if session.state() != TerminalState::AwaitingReattach {
                continue;
            }
            let result = self.reattach(station, &session).await;
            if let Err(err) = &result {
                station.dependents.lock().set_state(
                    &DependentKey::new(DependentKind::Terminal, session.terminal_id),
                    DependentState::Errored,
                );
                station.emit_node_error(node_id, err.clone());
            }
            results.push((session.terminal_id, result));
        }
        results
    }

    async fn reattach(
        &self,
        station: &Arc<Station>,
        session: &Arc<TerminalSession>,
    ) -> CoreResult<()> {
        let connection_id = station
            .node_connection(&session.node_id)
            .ok_or_else(|| CoreError::new(ErrorKind::NotFound, "node has no connection"))?;
        let record = station
            .pool
            .get(connection_id)
            .ok_or_else(|| CoreError::new(ErrorKind::NotFound, "connection vanished"))?;

        let size = session.size();
        let (pty, child) =
            util::timeout(self.channel_open_timeout, "terminal channel reopen", async {
                record
                    .session
                    .open_shell("xterm-256color", size, None)
                    .await
                    .map_err(Into::into)
            })
            .await?;

        let reader = pty.clone_reader().map_err(CoreError::internal)?;
        let writer = pty.clone_writer().map_err(CoreError::internal)?;

        let epoch = session.reader_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        session.pty.lock().replace(pty);
        session.writer.lock().replace(writer);
        session.child.lock().replace(child);
        *session.state.lock() = TerminalState::Streaming;
        station.dependents.lock().set_state(
            &DependentKey::new(DependentKind::Terminal, session.terminal_id),
            DependentState::Active,
        );

        spawn_reader(Arc::clone(session), reader, epoch);

        let generation = station
            .with_runtime(&session.node_id, |runtime| runtime.next_generation())
            .unwrap_or(0);
        station.notify(StationNotification::TerminalAttached {
            node_id: session.node_id.clone(),
            terminal_id: session.terminal_id,
            generation,
        });
        Ok(())
    }

    pub async fn close_all(&self) {
        let station = match Station::try_get() {
            Some(station) => station,
            None => return,
        };
        let ids: Vec<TerminalId> = self.terminals.read().keys().copied().collect();
        for terminal_id in ids {
            self.close(&station, terminal_id).await.ok();
        }
    }
}

/// Blocking reads live on a dedicated thread per channel; bytes land in
/// the scrollback ring and, when a peer is bound, as Output frames on
/// the endpoint.
fn spawn_reader(session: Arc<TerminalSession>, mut reader: Box<dyn Read + Send>, epoch: usize) {
    std::thread::Builder::new()
        .name(format!("term-reader-{}", session.terminal_id))
        .spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(size) => {
                        if session.current_epoch() != epoch {
                            break;
                        }
                        metrics::histogram!("terminal.read.bytes").record(size as f64);
                        session.scrollback.lock().push(&buf[..size]);
                        if let Some(tx) = session.endpoint.lock().as_ref() {
                            tx.send(Frame::Output(buf[..size].to_vec())).ok();
                        }
                        if let Some(station) = Station::try_get() {
                            station.notify(StationNotification::TerminalOutput(
                                session.terminal_id,
                            ));
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        log::debug!(
                            "terminal {} reader: {err}",
                            session.terminal_id
                        );
                        break;
                    }
                }
            }

            // EOF while streaming on the current channel means the
            // remote side ended the session; tear the terminal down.
            // EOF after an epoch bump is just the old channel dying.
            if session.current_epoch() == epoch
                && session.state() == TerminalState::Streaming
            {
                if let Some(station) = Station::try_get() {
                    let registry = &station.terminals;
                    *session.state.lock() = TerminalState::Closed;
                    registry.remove(&station, &session);
                }
            }
            log::trace!("terminal {} reader exited", session.terminal_id);
        })
        .expect("spawning terminal reader thread");
}
