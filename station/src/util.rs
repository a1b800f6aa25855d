//! Small shared pieces: cooperative cancellation, future timeouts,
//! single-flight locking, and descriptor/stream adaptation.

use crate::error::{CoreError, CoreResult, ErrorKind};
use smol::future::FutureExt;
use smol::Timer;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation token.  Long-running operations check it at
/// their suspension points.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> CoreResult<()> {
        if self.is_cancelled() {
            Err(CoreError::new(ErrorKind::Cancelled, "operation cancelled"))
        } else {
            Ok(())
        }
    }
}

/// Race a future against a deadline; the loser is dropped, which runs
/// its cleanup handlers.
pub async fn timeout<T, F>(limit: Duration, what: &str, fut: F) -> CoreResult<T>
where
    F: Future<Output = CoreResult<T>>,
{
    fut.or(async {
        Timer::after(limit).await;
        Err(CoreError::new(
            ErrorKind::Timeout,
            format!("{what} timed out after {limit:?}"),
        ))
    })
    .await
}

/// Try-acquire single-flight lock.  Unlike a mutex guard this is Send
/// and may be held across await points; contenders are told to retry
/// rather than queued.
#[derive(Debug, Default)]
pub struct FlightLock {
    busy: AtomicBool,
}

pub struct FlightGuard<'a> {
    lock: &'a FlightLock,
}

impl FlightLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<FlightGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Some(FlightGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.lock.busy.store(false, Ordering::SeqCst);
    }
}

/// Adapt a connected socketpair descriptor into an async stream so a
/// splice task can own it.
#[cfg(unix)]
pub fn fd_to_async_stream(
    fd: filedescriptor::FileDescriptor,
) -> anyhow::Result<smol::Async<std::os::unix::net::UnixStream>> {
    use std::os::unix::io::{FromRawFd, IntoRawFd};
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd.into_raw_fd()) };
    Ok(smol::Async::new(stream)?)
}

#[cfg(windows)]
pub fn fd_to_async_stream(
    fd: filedescriptor::FileDescriptor,
) -> anyhow::Result<smol::Async<std::net::TcpStream>> {
    use std::os::windows::io::{FromRawSocket, IntoRawSocket};
    let stream = unsafe { std::net::TcpStream::from_raw_socket(fd.into_raw_socket()) };
    Ok(smol::Async::new(stream)?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flight_lock_excludes() {
        let lock = FlightLock::new();
        let guard = lock.try_acquire().expect("first acquire");
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn cancel_token_reports() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        let err = token.check().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[test]
    fn timeout_fires() {
        let result: CoreResult<()> = smol::block_on(timeout(
            Duration::from_millis(10),
            "sleepy op",
            async {
                Timer::after(Duration::from_secs(5)).await;
                Ok(())
            },
        ));
        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);
    }

    #[test]
    fn timeout_passes_through() {
        let result = smol::block_on(timeout(
            Duration::from_secs(5),
            "quick op",
            async { Ok(42usize) },
        ));
        assert_eq!(result.unwrap(), 42);
    }
}
