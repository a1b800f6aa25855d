//! The local pty registry: child shells on pseudo-terminals.  Blocking
//! reads and writes live on dedicated threads per pty; the registry
//! lock is only ever held to touch the map.

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::scrollback::ScrollbackRing;
use parking_lot::{Mutex, RwLock};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use smol::Timer;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wire::Frame;

pub type PtyId = usize;

static PTY_ID: AtomicUsize = AtomicUsize::new(1);

fn alloc_pty_id() -> PtyId {
    PTY_ID.fetch_add(1, Ordering::Relaxed)
}

const PTY_SCROLLBACK_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShellSpec {
    /// Defaults to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyInfo {
    pub pty_id: PtyId,
    pub shell: String,
    pub rows: u16,
    pub cols: u16,
    pub alive: bool,
}

pub struct PtyEntry {
    pub pty_id: PtyId,
    pub shell: String,
    size: Mutex<PtySize>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    scrollback: Mutex<ScrollbackRing>,
    endpoint: Mutex<Option<flume::Sender<Frame>>>,
    dead: AtomicBool,
}

impl PtyEntry {
    pub fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    fn info(&self) -> PtyInfo {
        let size = *self.size.lock();
        PtyInfo {
            pty_id: self.pty_id,
            shell: self.shell.clone(),
            rows: size.rows,
            cols: size.cols,
            alive: self.is_alive(),
        }
    }
}

#[derive(Default)]
pub struct PtyRegistry {
    ptys: RwLock<HashMap<PtyId, Arc<PtyEntry>>>,
}

impl PtyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, pty_id: PtyId) -> CoreResult<Arc<PtyEntry>> {
        self.ptys
            .read()
            .get(&pty_id)
            .map(Arc::clone)
            .ok_or_else(|| CoreError::not_found(format!("pty {pty_id}")))
    }

    pub fn spawn(&self, spec: &ShellSpec) -> CoreResult<PtyId> {
        let shell = spec.shell.clone().unwrap_or_else(|| {
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
        });
        let size = PtySize {
            rows: spec.rows.unwrap_or(24),
            cols: spec.cols.unwrap_or(80),
            pixel_width: 0,
            pixel_height: 0,
        };

        let pty_system = native_pty_system();
        let pair = pty_system.openpty(size).map_err(|err| {
            CoreError::new(ErrorKind::ResourceExhausted, format!("openpty: {err:#}"))
        })?;

        let mut cmd = CommandBuilder::new(&shell);
        for arg in &spec.args {
            cmd.arg(arg);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }
        // The child inherits our environment; injected variables layer
        // on top, and TERM gets a sane default.
        if !spec.env.contains_key("TERM") && std::env::var_os("TERM").is_none() {
            cmd.env("TERM", "xterm-256color");
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|err| {
            CoreError::new(ErrorKind::Internal, format!("spawning {shell}: {err:#}"))
        })?;
        log::debug!("spawned {shell} in pty, pid {:?}", child.process_id());

        let writer = pair
            .master
            .take_writer()
            .map_err(CoreError::internal)?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(CoreError::internal)?;

        let pty_id = alloc_pty_id();
        let entry = Arc::new(PtyEntry {
            pty_id,
            shell,
            size: Mutex::new(size),
            master: Mutex::new(pair.master),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(child),
            scrollback: Mutex::new(ScrollbackRing::new(PTY_SCROLLBACK_BYTES)),
            endpoint: Mutex::new(None),
            dead: AtomicBool::new(false),
        });

        self.ptys.write().insert(pty_id, Arc::clone(&entry));
        spawn_pty_reader(entry, reader);
        Ok(pty_id)
    }

    pub fn write(&self, pty_id: PtyId, data: &[u8]) -> CoreResult<()> {
        let entry = self.get(pty_id)?;
        if !entry.is_alive() {
            self.ptys.write().remove(&pty_id);
            return Err(CoreError::new(
                ErrorKind::Transient,
                format!("pty {pty_id} child has exited"),
            )
            .with_tag("BROKEN_PIPE"));
        }
        let result = {
            let mut writer = entry.writer.lock();
            match writer.as_mut() {
                Some(w) => w.write_all(data),
                None => return Err(CoreError::not_found(format!("pty {pty_id} writer"))),
            }
        };
        result.map_err(|err| {
            // A write to a dead child surfaces here; drop the entry
            entry.dead.store(true, Ordering::SeqCst);
            self.ptys.write().remove(&pty_id);
            CoreError::new(ErrorKind::Transient, format!("pty {pty_id}: {err}"))
                .with_tag("BROKEN_PIPE")
        })
    }

    pub fn resize(&self, pty_id: PtyId, rows: u16, cols: u16) -> CoreResult<()> {
        let entry = self.get(pty_id)?;
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        *entry.size.lock() = size;
        let result = entry.master.lock().resize(size).map_err(CoreError::internal);
        result
    }

    pub fn close(&self, pty_id: PtyId) -> CoreResult<()> {
        let entry = self.get(pty_id)?;
        entry.child.lock().kill().ok();
        entry.writer.lock().take();
        entry.endpoint.lock().take();
        entry.dead.store(true, Ordering::SeqCst);
        self.ptys.write().remove(&pty_id);

        // Deferred sweep: rapid sequential closes can leave siblings
        // half-exited; a follow-up cleanup pass reconciles the registry
        // before the frontend's next strong sync.
        smol::spawn(async {
            Timer::after(Duration::from_millis(100)).await;
            if let Some(station) = crate::Station::try_get() {
                station.ptys.drain_cleanup();
            }
        })
        .detach();
        Ok(())
    }

    pub fn list(&self) -> Vec<PtyInfo> {
        self.ptys.read().values().map(|entry| entry.info()).collect()
    }

    /// Remove entries whose child has exited; returns the removed ids.
    pub fn drain_cleanup(&self) -> Vec<PtyId> {
        let mut removed = vec![];
        let mut ptys = self.ptys.write();
        ptys.retain(|pty_id, entry| {
            let exited = entry.dead.load(Ordering::SeqCst)
                || matches!(entry.child.lock().try_wait(), Ok(Some(_)));
            if exited {
                removed.push(*pty_id);
            }
            !exited
        });
        removed
    }

    pub fn attach_endpoint(&self, pty_id: PtyId) -> CoreResult<(flume::Receiver<Frame>, Vec<u8>)> {
        let entry = self.get(pty_id)?;
        let mut endpoint = entry.endpoint.lock();
        if endpoint.is_some() {
            return Err(CoreError::new(
                ErrorKind::AlreadyExists,
                format!("pty {pty_id} already has a bound peer"),
            ));
        }
        let (tx, rx) = flume::unbounded();
        endpoint.replace(tx);
        let snapshot = entry.scrollback.lock().snapshot();
        Ok((rx, snapshot))
    }

    pub fn detach_endpoint(&self, pty_id: PtyId) {
        if let Ok(entry) = self.get(pty_id) {
            entry.endpoint.lock().take();
        }
    }

    pub fn close_all(&self) {
        let ids: Vec<PtyId> = self.ptys.read().keys().copied().collect();
        for pty_id in ids {
            self.close(pty_id).ok();
        }
    }
}

/// One blocking reader thread per pty.  EOF or a read error marks the
/// entry dead; removal happens in `drain_cleanup`.
fn spawn_pty_reader(entry: Arc<PtyEntry>, mut reader: Box<dyn Read + Send>) {
    std::thread::Builder::new()
        .name(format!("pty-reader-{}", entry.pty_id))
        .spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(size) => {
                        metrics::histogram!("pty.read.bytes").record(size as f64);
                        entry.scrollback.lock().push(&buf[..size]);
                        if let Some(tx) = entry.endpoint.lock().as_ref() {
                            tx.send(Frame::Output(buf[..size].to_vec())).ok();
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        log::debug!("pty {} reader: {err}", entry.pty_id);
                        break;
                    }
                }
            }
            entry.dead.store(true, Ordering::SeqCst);
            log::trace!("pty {} reader exited", entry.pty_id);
        })
        .expect("spawning pty reader thread");
}
