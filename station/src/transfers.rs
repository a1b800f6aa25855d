//! SFTP sessions and the transfer queue.  A session is opened lazily
//! against a connection and carries a working-directory cursor and a
//! conflict policy.  Transfers are queued with bounded concurrency and
//! an optional global byte-rate cap; progress events are rate limited;
//! a transfer that dies with the link keeps its offset so it can be
//! reopened at `transferred` and finished.

use crate::config::CoreConfig;
use crate::dependents::{DependentKey, DependentKind, DependentState};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::node::NodeId;
use crate::util;
use crate::{Station, StationNotification};
use causeway_ssh::{FileMetadata, OpenOptions, Sftp};
use governor::{Quota, RateLimiter};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smol::Timer;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type SftpSessionId = usize;
pub type TransferId = usize;

static SFTP_SESSION_ID: AtomicUsize = AtomicUsize::new(1);
static TRANSFER_ID: AtomicUsize = AtomicUsize::new(1);

const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Active,
    Paused,
    Completed,
    Cancelled,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    Ask,
    Overwrite,
    Skip,
    Rename,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::Ask
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgress {
    pub transfer_id: TransferId,
    pub node_id: NodeId,
    pub transferred: u64,
    pub total: u64,
    pub state: TransferState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferInfo {
    pub transfer_id: TransferId,
    pub node_id: NodeId,
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: PathBuf,
    pub total: u64,
    pub transferred: u64,
    pub state: TransferState,
    pub error: Option<String>,
    pub started_at_ms: Option<u64>,
    pub ended_at_ms: Option<u64>,
}

pub struct Transfer {
    pub transfer_id: TransferId,
    pub node_id: NodeId,
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: PathBuf,
    total: AtomicU64,
    transferred: AtomicU64,
    state: Mutex<TransferState>,
    error: Mutex<Option<String>>,
    started_at: Mutex<Option<u64>>,
    ended_at: Mutex<Option<u64>>,
    last_progress: Mutex<Instant>,
}

impl Transfer {
    pub fn state(&self) -> TransferState {
        *self.state.lock()
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: TransferState) {
        *self.state.lock() = state;
    }

    fn fail(&self, message: impl Into<String>) {
        self.set_state(TransferState::Errored);
        self.error.lock().replace(message.into());
        self.ended_at.lock().replace(crate::epoch_millis());
    }

    fn info(&self) -> TransferInfo {
        TransferInfo {
            transfer_id: self.transfer_id,
            node_id: self.node_id.clone(),
            direction: self.direction,
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            total: self.total.load(Ordering::SeqCst),
            transferred: self.transferred(),
            state: self.state(),
            error: self.error.lock().clone(),
            started_at_ms: *self.started_at.lock(),
            ended_at_ms: *self.ended_at.lock(),
        }
    }

    fn progress(&self) -> TransferProgress {
        TransferProgress {
            transfer_id: self.transfer_id,
            node_id: self.node_id.clone(),
            transferred: self.transferred(),
            total: self.total.load(Ordering::SeqCst),
            state: self.state(),
        }
    }
}

pub struct SftpSessionRecord {
    pub session_id: SftpSessionId,
    pub node_id: NodeId,
    pub cwd: Mutex<PathBuf>,
    pub conflict_policy: Mutex<ConflictPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub size: Option<u64>,
    pub is_dir: bool,
}

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Token bucket over the global transfer byte budget.
struct RateGate {
    lim: DirectLimiter,
    cap: u32,
}

impl RateGate {
    fn new(bytes_per_second: u32) -> Option<Self> {
        let cap = NonZeroU32::new(bytes_per_second)?;
        Some(Self {
            lim: RateLimiter::direct(Quota::per_second(cap)),
            cap: bytes_per_second,
        })
    }

    /// Admit up to `amount` bytes, sleeping until the bucket allows it.
    /// Returns the admitted amount (clamped to bucket capacity).
    async fn admit(&self, amount: u32) -> u32 {
        let amount = amount.min(self.cap).max(1);
        let n = NonZeroU32::new(amount).expect("amount is clamped above zero");
        loop {
            if self.lim.check_n(n).is_ok() {
                return amount;
            }
            Timer::after(Duration::from_millis(50)).await;
        }
    }
}

pub struct TransferQueue {
    sessions: RwLock<HashMap<SftpSessionId, Arc<SftpSessionRecord>>>,
    transfers: RwLock<HashMap<TransferId, Arc<Transfer>>>,
    running: AtomicUsize,
    max_concurrency: usize,
    rate: Option<RateGate>,
    progress_interval: Duration,
    op_timeout: Duration,
}

impl TransferQueue {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            transfers: RwLock::new(HashMap::new()),
            running: AtomicUsize::new(0),
            max_concurrency: config.transfer_concurrency,
            rate: RateGate::new(config.transfer_rate_cap),
            progress_interval: config.transfer_progress_interval(),
            op_timeout: config.sftp_op_timeout(),
        }
    }

    // ----- sessions --------------------------------------------------

    pub async fn open_session(
        &self,
        station: &Arc<Station>,
        node_id: &str,
    ) -> CoreResult<SftpSessionId> {
        let record = station.resolve_connection(node_id).await?;
        let sftp = record.session.sftp();
        let home = util::timeout(self.op_timeout, "sftp open", async {
            sftp.canonicalize(Path::new("."))
                .await
                .map_err(|err| CoreError::new(ErrorKind::Transient, err.to_string()))
        })
        .await?;

        let session_id = SFTP_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().insert(
            session_id,
            Arc::new(SftpSessionRecord {
                session_id,
                node_id: node_id.to_string(),
                cwd: Mutex::new(home),
                conflict_policy: Mutex::new(ConflictPolicy::default()),
            }),
        );
        station.register_dependent(DependentKey::new(DependentKind::Sftp, session_id), node_id)?;
        Ok(session_id)
    }

    pub fn session(&self, session_id: SftpSessionId) -> CoreResult<Arc<SftpSessionRecord>> {
        self.sessions
            .read()
            .get(&session_id)
            .map(Arc::clone)
            .ok_or_else(|| CoreError::not_found(format!("sftp session {session_id}")))
    }

    pub fn set_conflict_policy(
        &self,
        session_id: SftpSessionId,
        policy: ConflictPolicy,
    ) -> CoreResult<()> {
        *self.session(session_id)?.conflict_policy.lock() = policy;
        Ok(())
    }

    pub async fn close_session(
        &self,
        station: &Arc<Station>,
        session_id: SftpSessionId,
    ) -> CoreResult<()> {
        self.sessions.write().remove(&session_id);
        station.unregister_dependent(&DependentKey::new(DependentKind::Sftp, session_id));
        Ok(())
    }

    pub async fn list_dir(
        &self,
        station: &Arc<Station>,
        session_id: SftpSessionId,
        path: Option<&Path>,
    ) -> CoreResult<Vec<DirEntry>> {
        let session = self.session(session_id)?;
        let sftp = node_sftp(station, &session.node_id)?;
        let dir = match path {
            Some(path) => {
                let resolved = resolve_path(&session.cwd.lock(), path);
                *session.cwd.lock() = resolved.clone();
                resolved
            }
            None => session.cwd.lock().clone(),
        };

        let entries = util::timeout(self.op_timeout, "sftp readdir", async {
            sftp.read_dir(&dir)
                .await
                .map_err(|err| CoreError::new(ErrorKind::Transient, err.to_string()))
        })
        .await?;

        Ok(entries
            .into_iter()
            .map(|(path, meta)| DirEntry {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.to_string_lossy().to_string()),
                size: meta.size,
                is_dir: meta.is_dir,
            })
            .collect())
    }

    // ----- transfers -------------------------------------------------

    pub fn enqueue(
        &self,
        station: &Arc<Station>,
        session_id: SftpSessionId,
        direction: TransferDirection,
        local_path: &Path,
        remote_path: &Path,
    ) -> CoreResult<TransferId> {
        let session = self.session(session_id)?;
        let transfer = Arc::new(Transfer {
            transfer_id: TRANSFER_ID.fetch_add(1, Ordering::Relaxed),
            node_id: session.node_id.clone(),
            direction,
            local_path: local_path.to_path_buf(),
            remote_path: resolve_path(&session.cwd.lock(), remote_path),
            total: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            state: Mutex::new(TransferState::Pending),
            error: Mutex::new(None),
            started_at: Mutex::new(None),
            ended_at: Mutex::new(None),
            last_progress: Mutex::new(Instant::now()),
        });
        let transfer_id = transfer.transfer_id;
        self.transfers.write().insert(transfer_id, transfer);
        self.pump(station);
        Ok(transfer_id)
    }

    pub fn get(&self, transfer_id: TransferId) -> CoreResult<Arc<Transfer>> {
        self.transfers
            .read()
            .get(&transfer_id)
            .map(Arc::clone)
            .ok_or_else(|| CoreError::not_found(format!("transfer {transfer_id}")))
    }

    pub fn list(&self) -> Vec<TransferInfo> {
        self.transfers.read().values().map(|t| t.info()).collect()
    }

    /// Start (or restart) a transfer.  Restarting an errored transfer
    /// resumes at the preserved offset.
    pub fn start(&self, station: &Arc<Station>, transfer_id: TransferId) -> CoreResult<()> {
        let transfer = self.get(transfer_id)?;
        match transfer.state() {
            TransferState::Pending | TransferState::Paused | TransferState::Errored => {
                transfer.error.lock().take();
                transfer.set_state(TransferState::Pending);
                self.pump(station);
                Ok(())
            }
            TransferState::Active => Ok(()),
            state => Err(CoreError::new(
                ErrorKind::Unsupported,
                format!("transfer {transfer_id} is {state:?}"),
            )),
        }
    }

    pub fn pause(&self, transfer_id: TransferId) -> CoreResult<()> {
        let transfer = self.get(transfer_id)?;
        if transfer.state() == TransferState::Active {
            transfer.set_state(TransferState::Paused);
        }
        Ok(())
    }

    pub fn cancel(&self, transfer_id: TransferId) -> CoreResult<()> {
        let transfer = self.get(transfer_id)?;
        match transfer.state() {
            TransferState::Completed | TransferState::Cancelled => {}
            _ => {
                transfer.set_state(TransferState::Cancelled);
                transfer.ended_at.lock().replace(crate::epoch_millis());
            }
        }
        Ok(())
    }

    pub fn cancel_all(&self) {
        for transfer in self.transfers.read().values() {
            if matches!(
                transfer.state(),
                TransferState::Active | TransferState::Pending | TransferState::Paused
            ) {
                transfer.set_state(TransferState::Cancelled);
            }
        }
    }

    /// Drain phase: in-flight transfers for a node become errored with
    /// their offsets preserved, ready for resume after recovery.
    pub fn drain_node(&self, station: &Arc<Station>, node_id: &str) {
        for transfer in self.transfers.read().values() {
            if transfer.node_id == node_id
                && matches!(
                    transfer.state(),
                    TransferState::Active | TransferState::Pending
                )
            {
                transfer.fail("link down; offset preserved for resume");
            }
        }
        let sessions: Vec<Arc<SftpSessionRecord>> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.node_id == node_id)
            .map(Arc::clone)
            .collect();
        for session in sessions {
            station.dependents.lock().set_state(
                &DependentKey::new(DependentKind::Sftp, session.session_id),
                DependentState::Suspended,
            );
        }
    }

    /// Restore phase: session records flip back to active (the sftp
    /// subsystem re-initializes lazily on the next operation).  Errored
    /// transfers keep their offsets and wait for an explicit restart.
    pub fn restore_node(&self, station: &Arc<Station>, node_id: &str) {
        let sessions: Vec<Arc<SftpSessionRecord>> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.node_id == node_id)
            .map(Arc::clone)
            .collect();
        for session in sessions {
            station.dependents.lock().set_state(
                &DependentKey::new(DependentKind::Sftp, session.session_id),
                DependentState::Active,
            );
        }
    }

    /// Move pending work onto workers while capacity remains.
    fn pump(&self, station: &Arc<Station>) {
        loop {
            if self.running.load(Ordering::SeqCst) >= self.max_concurrency {
                return;
            }
            let next = {
                let transfers = self.transfers.read();
                let mut pending: Vec<&Arc<Transfer>> = transfers
                    .values()
                    .filter(|t| t.state() == TransferState::Pending)
                    .collect();
                pending.sort_by_key(|t| t.transfer_id);
                pending.first().map(|t| Arc::clone(*t))
            };
            let transfer = match next {
                Some(transfer) => transfer,
                None => return,
            };

            transfer.set_state(TransferState::Active);
            transfer
                .started_at
                .lock()
                .get_or_insert_with(crate::epoch_millis);
            self.running.fetch_add(1, Ordering::SeqCst);

            let station = Arc::clone(station);
            smol::spawn(async move {
                let queue = &station.transfers;
                let result = queue.run_transfer(&station, &transfer).await;
                match result {
                    Ok(()) => {}
                    Err(err) => {
                        log::debug!("transfer {}: {err}", transfer.transfer_id);
                        if transfer.state() == TransferState::Active {
                            transfer.fail(err.message.clone());
                        }
                    }
                }
                queue.emit_progress(&station, &transfer, true);
                queue.running.fetch_sub(1, Ordering::SeqCst);
                queue.pump(&station);
            })
            .detach();
        }
    }

    async fn run_transfer(
        &self,
        station: &Arc<Station>,
        transfer: &Arc<Transfer>,
    ) -> CoreResult<()> {
        let sftp = node_sftp(station, &transfer.node_id)?;
        match transfer.direction {
            TransferDirection::Upload => self.run_upload(station, transfer, sftp).await,
            TransferDirection::Download => self.run_download(station, transfer, sftp).await,
        }
    }

    async fn run_upload(
        &self,
        station: &Arc<Station>,
        transfer: &Arc<Transfer>,
        sftp: Sftp,
    ) -> CoreResult<()> {
        let offset = transfer.transferred();
        let local_path = transfer.local_path.clone();

        let (mut local, total) = smol::unblock(move || {
            let mut file = std::fs::File::open(&local_path)?;
            let total = file.metadata()?.len();
            if offset > 0 {
                file.seek(SeekFrom::Start(offset))?;
            }
            Ok::<_, std::io::Error>((file, total))
        })
        .await
        .map_err(|err| CoreError::new(ErrorKind::NotFound, format!("local file: {err}")))?;
        transfer.total.store(total, Ordering::SeqCst);

        let mut remote_path = transfer.remote_path.clone();
        let opts = if offset > 0 {
            OpenOptions::resuming()
        } else {
            // Fresh upload: apply the conflict policy if the target
            // already exists.
            match sftp.stat(&remote_path).await {
                Ok(meta) => {
                    match self.apply_conflict_policy(station, transfer, &remote_path, &meta)? {
                        ConflictOutcome::Proceed => {}
                        ConflictOutcome::Renamed(renamed) => remote_path = renamed,
                        ConflictOutcome::Skipped => {
                            transfer.set_state(TransferState::Cancelled);
                            transfer.ended_at.lock().replace(crate::epoch_millis());
                            return Ok(());
                        }
                    }
                    OpenOptions::writing()
                }
                Err(_) => OpenOptions::writing(),
            }
        };

        let remote = util::timeout(self.op_timeout, "remote open", async {
            sftp.open(&remote_path, opts)
                .await
                .map_err(|err| CoreError::new(ErrorKind::Transient, err.to_string()))
        })
        .await?;

        if offset > 0 {
            // Random access is the capability resume depends on; when
            // the server refuses, the transfer stays errored with a
            // reason the UI can show.
            remote.seek(offset).await.map_err(|err| {
                CoreError::new(
                    ErrorKind::Unsupported,
                    format!("server does not support resume at offset: {err}"),
                )
            })?;
        }

        loop {
            match transfer.state() {
                TransferState::Active => {}
                TransferState::Paused | TransferState::Cancelled | TransferState::Errored => {
                    return Ok(());
                }
                other => {
                    return Err(CoreError::internal(format!(
                        "transfer in unexpected state {other:?}"
                    )))
                }
            }

            let mut chunk = CHUNK_SIZE as u32;
            if let Some(rate) = &self.rate {
                chunk = rate.admit(chunk).await;
            }

            let (file, buf) = {
                let mut buf = vec![0u8; chunk as usize];
                let file = local;
                smol::unblock(move || {
                    let mut f = file;
                    let n = f.read(&mut buf)?;
                    buf.truncate(n);
                    Ok::<_, std::io::Error>((f, buf))
                })
                .await
                .map_err(|err| CoreError::new(ErrorKind::Internal, format!("local read: {err}")))?
            };
            local = file;

            if buf.is_empty() {
                break;
            }

            let written = buf.len() as u64;
            util::timeout(self.op_timeout, "remote write", async {
                remote
                    .write(buf)
                    .await
                    .map_err(|err| CoreError::new(ErrorKind::Transient, err.to_string()))
            })
            .await?;

            transfer.transferred.fetch_add(written, Ordering::SeqCst);
            self.emit_progress(station, transfer, false);
        }

        remote.close().await.ok();
        transfer.set_state(TransferState::Completed);
        transfer.ended_at.lock().replace(crate::epoch_millis());
        Ok(())
    }

    async fn run_download(
        &self,
        station: &Arc<Station>,
        transfer: &Arc<Transfer>,
        sftp: Sftp,
    ) -> CoreResult<()> {
        let offset = transfer.transferred();

        let meta = util::timeout(self.op_timeout, "remote stat", async {
            sftp.stat(&transfer.remote_path)
                .await
                .map_err(|err| CoreError::new(ErrorKind::NotFound, err.to_string()))
        })
        .await?;
        transfer
            .total
            .store(meta.size.unwrap_or(0), Ordering::SeqCst);

        let mut local_path = transfer.local_path.clone();
        if offset == 0 && local_path.exists() {
            let local_meta = FileMetadata {
                size: std::fs::metadata(&local_path).ok().map(|m| m.len()),
                is_dir: local_path.is_dir(),
                is_file: local_path.is_file(),
                perm: None,
                mtime: None,
            };
            match self.apply_conflict_policy(station, transfer, &local_path, &local_meta)? {
                ConflictOutcome::Proceed => {}
                ConflictOutcome::Renamed(renamed) => local_path = renamed,
                ConflictOutcome::Skipped => {
                    transfer.set_state(TransferState::Cancelled);
                    transfer.ended_at.lock().replace(crate::epoch_millis());
                    return Ok(());
                }
            }
        }

        let remote = util::timeout(self.op_timeout, "remote open", async {
            sftp.open(&transfer.remote_path, OpenOptions::reading())
                .await
                .map_err(|err| CoreError::new(ErrorKind::Transient, err.to_string()))
        })
        .await?;
        if offset > 0 {
            remote.seek(offset).await.map_err(|err| {
                CoreError::new(
                    ErrorKind::Unsupported,
                    format!("server does not support resume at offset: {err}"),
                )
            })?;
        }

        let mut local = {
            let path = local_path.clone();
            smol::unblock(move || {
                let mut file = std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .open(&path)?;
                if offset > 0 {
                    file.seek(SeekFrom::Start(offset))?;
                } else {
                    file.set_len(0)?;
                }
                Ok::<_, std::io::Error>(file)
            })
            .await
            .map_err(|err| CoreError::new(ErrorKind::Internal, format!("local open: {err}")))?
        };

        loop {
            match transfer.state() {
                TransferState::Active => {}
                _ => return Ok(()),
            }

            let mut chunk = CHUNK_SIZE as u32;
            if let Some(rate) = &self.rate {
                chunk = rate.admit(chunk).await;
            }

            let buf = util::timeout(self.op_timeout, "remote read", async {
                remote
                    .read(chunk as usize)
                    .await
                    .map_err(|err| CoreError::new(ErrorKind::Transient, err.to_string()))
            })
            .await?;
            if buf.is_empty() {
                break;
            }

            let n = buf.len() as u64;
            local = smol::unblock(move || {
                let mut f = local;
                f.write_all(&buf)?;
                Ok::<_, std::io::Error>(f)
            })
            .await
            .map_err(|err| CoreError::new(ErrorKind::Internal, format!("local write: {err}")))?;

            transfer.transferred.fetch_add(n, Ordering::SeqCst);
            self.emit_progress(station, transfer, false);
        }

        smol::unblock(move || local.sync_all()).await.ok();
        remote.close().await.ok();
        transfer.set_state(TransferState::Completed);
        transfer.ended_at.lock().replace(crate::epoch_millis());
        Ok(())
    }

    fn apply_conflict_policy(
        &self,
        _station: &Arc<Station>,
        transfer: &Arc<Transfer>,
        dest: &Path,
        _existing: &FileMetadata,
    ) -> CoreResult<ConflictOutcome> {
        let policy = self
            .sessions
            .read()
            .values()
            .find(|s| s.node_id == transfer.node_id)
            .map(|s| *s.conflict_policy.lock())
            .unwrap_or_default();

        match policy {
            ConflictPolicy::Overwrite => Ok(ConflictOutcome::Proceed),
            ConflictPolicy::Skip => Ok(ConflictOutcome::Skipped),
            ConflictPolicy::Rename => Ok(ConflictOutcome::Renamed(rename_for_conflict(dest))),
            ConflictPolicy::Ask => Err(CoreError::new(
                ErrorKind::AlreadyExists,
                format!("destination {} exists", dest.display()),
            )
            .with_tag("DEST_EXISTS")),
        }
    }

    fn emit_progress(&self, station: &Arc<Station>, transfer: &Arc<Transfer>, force: bool) {
        if !force {
            let mut last = transfer.last_progress.lock();
            if last.elapsed() < self.progress_interval {
                return;
            }
            *last = Instant::now();
        }
        station.notify(StationNotification::TransferProgress(transfer.progress()));
    }
}

enum ConflictOutcome {
    Proceed,
    Skipped,
    Renamed(PathBuf),
}

fn node_sftp(station: &Arc<Station>, node_id: &str) -> CoreResult<Sftp> {
    let connection_id = station.node_connection(node_id).ok_or_else(|| {
        CoreError::new(ErrorKind::NotFound, format!("node {node_id} is not connected"))
    })?;
    station
        .pool
        .borrow(connection_id)
        .map(|session| session.sftp())
        .ok_or_else(|| {
            CoreError::new(
                ErrorKind::BusyRetryLater,
                format!("connection for node {node_id} is not active"),
            )
        })
}

fn resolve_path(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// `report.pdf` -> `report (1).pdf`, or with a bumped counter until
/// the name is free locally.  Remote renames just take the first form.
fn rename_for_conflict(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();

    for counter in 1..1000 {
        let candidate = parent.join(format!("{stem} ({counter}){ext}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    parent.join(format!("{stem} (copy){ext}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolve_relative_against_cwd() {
        assert_eq!(
            resolve_path(Path::new("/home/u"), Path::new("data/x.bin")),
            PathBuf::from("/home/u/data/x.bin")
        );
        assert_eq!(
            resolve_path(Path::new("/home/u"), Path::new("/tmp/x")),
            PathBuf::from("/tmp/x")
        );
    }

    #[test]
    fn conflict_rename_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        let renamed = rename_for_conflict(&path);
        assert_eq!(
            renamed.file_name().unwrap().to_string_lossy(),
            "report (1).pdf"
        );

        // When (1) is taken the counter bumps
        std::fs::write(dir.path().join("report (1).pdf"), b"x").unwrap();
        let renamed = rename_for_conflict(&path);
        assert_eq!(
            renamed.file_name().unwrap().to_string_lossy(),
            "report (2).pdf"
        );
    }

    #[test]
    fn conflict_policy_default_is_ask() {
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::Ask);
    }
}
