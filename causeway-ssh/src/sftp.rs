//! Filesystem operations over the transport's sftp subsystem.
//! The subsystem is initialized lazily by the first operation; file
//! handles are owned by the transport thread and addressed by id.

use crate::session::{Request, RequestQueue};
use crate::transport::{FileId, TransportTask};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SftpError {
    #[error(transparent)]
    Ssh(#[from] ssh2::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("sftp session is gone")]
    Disconnected,
    #[error("invalid file handle")]
    InvalidHandle,
}

pub type SftpResult<T> = Result<T, SftpError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    /// Mode for newly created files.
    pub mode: i32,
}

impl OpenOptions {
    pub fn reading() -> Self {
        Self {
            read: true,
            mode: 0o644,
            ..Default::default()
        }
    }

    pub fn writing() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            mode: 0o644,
            ..Default::default()
        }
    }

    /// Writing without truncation, for resuming at an offset.
    pub fn resuming() -> Self {
        Self {
            write: true,
            create: true,
            mode: 0o644,
            ..Default::default()
        }
    }

    fn flags(&self) -> ssh2::OpenFlags {
        let mut flags = ssh2::OpenFlags::empty();
        if self.read {
            flags |= ssh2::OpenFlags::READ;
        }
        if self.write {
            flags |= ssh2::OpenFlags::WRITE;
        }
        if self.append {
            flags |= ssh2::OpenFlags::APPEND;
        }
        if self.create {
            flags |= ssh2::OpenFlags::CREATE;
        }
        if self.truncate {
            flags |= ssh2::OpenFlags::TRUNCATE;
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: Option<u64>,
    pub is_dir: bool,
    pub is_file: bool,
    pub perm: Option<u32>,
    pub mtime: Option<u64>,
}

impl From<ssh2::FileStat> for FileMetadata {
    fn from(stat: ssh2::FileStat) -> Self {
        Self {
            size: stat.size,
            is_dir: stat.is_dir(),
            is_file: stat.is_file(),
            perm: stat.perm,
            mtime: stat.mtime,
        }
    }
}

#[derive(Debug)]
pub(crate) enum FileOp {
    Open(Open),
    ReadFile(ReadFile),
    WriteFile(WriteFile),
    SeekFile(SeekFile),
    FsyncFile(FsyncFile),
    CloseFile(CloseFile),
    Stat(Stat),
    ReadDir(ReadDir),
    CreateDir(CreateDir),
    RemoveDir(RemoveDir),
    RemoveFile(RemoveFile),
    Rename(Rename),
    Canonicalize(Canonicalize),
}

#[derive(Debug)]
pub(crate) struct Open {
    pub path: PathBuf,
    pub opts: OpenOptions,
    pub reply: flume::Sender<SftpResult<FileId>>,
}

#[derive(Debug)]
pub(crate) struct ReadFile {
    pub file_id: FileId,
    pub max_bytes: usize,
    pub reply: flume::Sender<SftpResult<Vec<u8>>>,
}

#[derive(Debug)]
pub(crate) struct WriteFile {
    pub file_id: FileId,
    pub data: Vec<u8>,
    pub reply: flume::Sender<SftpResult<()>>,
}

#[derive(Debug)]
pub(crate) struct SeekFile {
    pub file_id: FileId,
    pub offset: u64,
    pub reply: flume::Sender<SftpResult<()>>,
}

#[derive(Debug)]
pub(crate) struct FsyncFile {
    pub file_id: FileId,
    pub reply: flume::Sender<SftpResult<()>>,
}

#[derive(Debug)]
pub(crate) struct CloseFile {
    pub file_id: FileId,
    pub reply: flume::Sender<SftpResult<()>>,
}

#[derive(Debug)]
pub(crate) struct Stat {
    pub path: PathBuf,
    pub reply: flume::Sender<SftpResult<FileMetadata>>,
}

#[derive(Debug)]
pub(crate) struct ReadDir {
    pub path: PathBuf,
    pub reply: flume::Sender<SftpResult<Vec<(PathBuf, FileMetadata)>>>,
}

#[derive(Debug)]
pub(crate) struct CreateDir {
    pub path: PathBuf,
    pub mode: i32,
    pub reply: flume::Sender<SftpResult<()>>,
}

#[derive(Debug)]
pub(crate) struct RemoveDir {
    pub path: PathBuf,
    pub reply: flume::Sender<SftpResult<()>>,
}

#[derive(Debug)]
pub(crate) struct RemoveFile {
    pub path: PathBuf,
    pub reply: flume::Sender<SftpResult<()>>,
}

#[derive(Debug)]
pub(crate) struct Rename {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub reply: flume::Sender<SftpResult<()>>,
}

#[derive(Debug)]
pub(crate) struct Canonicalize {
    pub path: PathBuf,
    pub reply: flume::Sender<SftpResult<PathBuf>>,
}

/// Cloneable handle for filesystem operations on one transport.
#[derive(Clone)]
pub struct Sftp {
    pub(crate) queue: RequestQueue,
}

impl Sftp {
    async fn submit<T>(
        &self,
        op: FileOp,
        rx: flume::Receiver<SftpResult<T>>,
    ) -> SftpResult<T> {
        self.queue
            .post(Request::Files(op))
            .map_err(|_| SftpError::Disconnected)?;
        rx.recv_async().await.map_err(|_| SftpError::Disconnected)?
    }

    pub async fn open(&self, path: &Path, opts: OpenOptions) -> SftpResult<SftpFile> {
        let (reply, rx) = flume::bounded(1);
        let file_id = self
            .submit(
                FileOp::Open(Open {
                    path: path.to_path_buf(),
                    opts,
                    reply,
                }),
                rx,
            )
            .await?;
        Ok(SftpFile {
            file_id,
            queue: self.queue.clone(),
            closed: false,
        })
    }

    pub async fn stat(&self, path: &Path) -> SftpResult<FileMetadata> {
        let (reply, rx) = flume::bounded(1);
        self.submit(
            FileOp::Stat(Stat {
                path: path.to_path_buf(),
                reply,
            }),
            rx,
        )
        .await
    }

    pub async fn read_dir(&self, path: &Path) -> SftpResult<Vec<(PathBuf, FileMetadata)>> {
        let (reply, rx) = flume::bounded(1);
        self.submit(
            FileOp::ReadDir(ReadDir {
                path: path.to_path_buf(),
                reply,
            }),
            rx,
        )
        .await
    }

    pub async fn create_dir(&self, path: &Path, mode: i32) -> SftpResult<()> {
        let (reply, rx) = flume::bounded(1);
        self.submit(
            FileOp::CreateDir(CreateDir {
                path: path.to_path_buf(),
                mode,
                reply,
            }),
            rx,
        )
        .await
    }

    pub async fn remove_dir(&self, path: &Path) -> SftpResult<()> {
        let (reply, rx) = flume::bounded(1);
        self.submit(
            FileOp::RemoveDir(RemoveDir {
                path: path.to_path_buf(),
                reply,
            }),
            rx,
        )
        .await
    }

    pub async fn remove_file(&self, path: &Path) -> SftpResult<()> {
        let (reply, rx) = flume::bounded(1);
        self.submit(
            FileOp::RemoveFile(RemoveFile {
                path: path.to_path_buf(),
                reply,
            }),
            rx,
        )
        .await
    }

    pub async fn rename(&self, src: &Path, dst: &Path) -> SftpResult<()> {
        let (reply, rx) = flume::bounded(1);
        self.submit(
            FileOp::Rename(Rename {
                src: src.to_path_buf(),
                dst: dst.to_path_buf(),
                reply,
            }),
            rx,
        )
        .await
    }

    pub async fn canonicalize(&self, path: &Path) -> SftpResult<PathBuf> {
        let (reply, rx) = flume::bounded(1);
        self.submit(
            FileOp::Canonicalize(Canonicalize {
                path: path.to_path_buf(),
                reply,
            }),
            rx,
        )
        .await
    }
}

/// A remote file handle.  Reads and writes are chunked requests to the
/// transport thread; dropping the handle closes the remote file.
pub struct SftpFile {
    file_id: FileId,
    queue: RequestQueue,
    closed: bool,
}

impl SftpFile {
    pub async fn read(&self, max_bytes: usize) -> SftpResult<Vec<u8>> {
        let (reply, rx) = flume::bounded(1);
        self.queue
            .post(Request::Files(FileOp::ReadFile(ReadFile {
                file_id: self.file_id,
                max_bytes,
                reply,
            })))
            .map_err(|_| SftpError::Disconnected)?;
        rx.recv_async().await.map_err(|_| SftpError::Disconnected)?
    }

    pub async fn write(&self, data: Vec<u8>) -> SftpResult<()> {
        let (reply, rx) = flume::bounded(1);
        self.queue
            .post(Request::Files(FileOp::WriteFile(WriteFile {
                file_id: self.file_id,
                data,
                reply,
            })))
            .map_err(|_| SftpError::Disconnected)?;
        rx.recv_async().await.map_err(|_| SftpError::Disconnected)?
    }

    /// Position the handle at an absolute offset; the primitive that
    /// makes transfer resume possible.
    pub async fn seek(&self, offset: u64) -> SftpResult<()> {
        let (reply, rx) = flume::bounded(1);
        self.queue
            .post(Request::Files(FileOp::SeekFile(SeekFile {
                file_id: self.file_id,
                offset,
                reply,
            })))
            .map_err(|_| SftpError::Disconnected)?;
        rx.recv_async().await.map_err(|_| SftpError::Disconnected)?
    }

    pub async fn fsync(&self) -> SftpResult<()> {
        let (reply, rx) = flume::bounded(1);
        self.queue
            .post(Request::Files(FileOp::FsyncFile(FsyncFile {
                file_id: self.file_id,
                reply,
            })))
            .map_err(|_| SftpError::Disconnected)?;
        rx.recv_async().await.map_err(|_| SftpError::Disconnected)?
    }

    pub async fn close(mut self) -> SftpResult<()> {
        self.closed = true;
        let (reply, rx) = flume::bounded(1);
        self.queue
            .post(Request::Files(FileOp::CloseFile(CloseFile {
                file_id: self.file_id,
                reply,
            })))
            .map_err(|_| SftpError::Disconnected)?;
        rx.recv_async().await.map_err(|_| SftpError::Disconnected)?
    }
}

impl Drop for SftpFile {
    fn drop(&mut self) {
        if !self.closed {
            let (reply, _rx) = flume::bounded(1);
            self.queue
                .post(Request::Files(FileOp::CloseFile(CloseFile {
                    file_id: self.file_id,
                    reply,
                })))
                .ok();
        }
    }
}

impl TransportTask {
    fn init_sftp<'a>(&'a mut self, sess: &mut ssh2::Session) -> SftpResult<&'a ssh2::Sftp> {
        if self.sftp.is_none() {
            self.sftp = Some(sess.sftp()?);
        }
        Ok(self.sftp.as_ref().expect("sftp was just initialized"))
    }

    pub(crate) fn handle_file_op(&mut self, sess: &mut ssh2::Session, op: FileOp) {
        match op {
            FileOp::Open(msg) => {
                let result = self.init_sftp(sess).and_then(|sftp| {
                    sftp.open_mode(
                        &msg.path,
                        msg.opts.flags(),
                        msg.opts.mode,
                        ssh2::OpenType::File,
                    )
                    .map_err(SftpError::from)
                });
                match result {
                    Ok(file) => {
                        let file_id = self.next_file_id;
                        self.next_file_id += 1;
                        self.files.insert(file_id, file);
                        msg.reply.try_send(Ok(file_id)).ok();
                    }
                    Err(err) => {
                        msg.reply.try_send(Err(err)).ok();
                    }
                }
            }
            FileOp::ReadFile(msg) => {
                let result = match self.files.get_mut(&msg.file_id) {
                    Some(file) => {
                        let mut buf = vec![0u8; msg.max_bytes];
                        match file.read(&mut buf) {
                            Ok(n) => {
                                buf.truncate(n);
                                Ok(buf)
                            }
                            Err(err) => Err(err.into()),
                        }
                    }
                    None => Err(SftpError::InvalidHandle),
                };
                msg.reply.try_send(result).ok();
            }
            FileOp::WriteFile(msg) => {
                let result = match self.files.get_mut(&msg.file_id) {
                    Some(file) => file.write_all(&msg.data).map_err(SftpError::from),
                    None => Err(SftpError::InvalidHandle),
                };
                msg.reply.try_send(result).ok();
            }
            FileOp::SeekFile(msg) => {
                let result = match self.files.get_mut(&msg.file_id) {
                    Some(file) => file
                        .seek(SeekFrom::Start(msg.offset))
                        .map(|_| ())
                        .map_err(SftpError::from),
                    None => Err(SftpError::InvalidHandle),
                };
                msg.reply.try_send(result).ok();
            }
            FileOp::FsyncFile(msg) => {
                let result = match self.files.get_mut(&msg.file_id) {
                    Some(file) => file.fsync().map_err(SftpError::from),
                    None => Err(SftpError::InvalidHandle),
                };
                msg.reply.try_send(result).ok();
            }
            FileOp::CloseFile(msg) => {
                self.files.remove(&msg.file_id);
                msg.reply.try_send(Ok(())).ok();
            }
            FileOp::Stat(msg) => {
                let result = self
                    .init_sftp(sess)
                    .and_then(|sftp| sftp.stat(&msg.path).map_err(SftpError::from))
                    .map(FileMetadata::from);
                msg.reply.try_send(result).ok();
            }
            FileOp::ReadDir(msg) => {
                let result = self
                    .init_sftp(sess)
                    .and_then(|sftp| sftp.readdir(&msg.path).map_err(SftpError::from))
                    .map(|entries| {
                        entries
                            .into_iter()
                            .map(|(path, stat)| (path, FileMetadata::from(stat)))
                            .collect()
                    });
                msg.reply.try_send(result).ok();
            }
            FileOp::CreateDir(msg) => {
                let result = self
                    .init_sftp(sess)
                    .and_then(|sftp| sftp.mkdir(&msg.path, msg.mode).map_err(SftpError::from));
                msg.reply.try_send(result).ok();
            }
            FileOp::RemoveDir(msg) => {
                let result = self
                    .init_sftp(sess)
                    .and_then(|sftp| sftp.rmdir(&msg.path).map_err(SftpError::from));
                msg.reply.try_send(result).ok();
            }
            FileOp::RemoveFile(msg) => {
                let result = self
                    .init_sftp(sess)
                    .and_then(|sftp| sftp.unlink(&msg.path).map_err(SftpError::from));
                msg.reply.try_send(result).ok();
            }
            FileOp::Rename(msg) => {
                let result = self.init_sftp(sess).and_then(|sftp| {
                    sftp.rename(&msg.src, &msg.dst, None).map_err(SftpError::from)
                });
                msg.reply.try_send(result).ok();
            }
            FileOp::Canonicalize(msg) => {
                let result = self
                    .init_sftp(sess)
                    .and_then(|sftp| sftp.realpath(&msg.path).map_err(SftpError::from));
                msg.reply.try_send(result).ok();
            }
        }
    }
}
