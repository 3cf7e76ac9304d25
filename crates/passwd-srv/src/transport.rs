//! Unix socket transport.
//!
//! One connection carries one request: the daemon peeks a full ciphertext
//! block, replies with a 4-byte status, half-closes and drops the socket.

use std::fs;
use std::io;
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::socket::{
    AddressFamily, Backlog, MsgFlags, SockFlag, SockType, UnixAddr, accept4, bind, listen, recv,
    send, socket,
};
use nix::unistd::{pipe2, write};
use passwd_srv_protocol::Status;

use crate::error::TransportError;

/// Mode of the listening socket file.
pub const SOCKET_MODE: u32 = 0o766;

/// Pending connections allowed while one request is being served.
pub const BACKLOG: i32 = 3;

/// Most bytes discarded from a connection before replying.
const MAX_DRAIN: usize = 64 * 1024;

/// Write end of the pipe the signal handler wakes the serve loop through.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_terminate(_signal: libc::c_int) {
    let saved = Errno::last_raw();
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        // SAFETY: write(2) is async-signal-safe and the buffer outlives the call.
        unsafe { libc::write(fd, [1u8].as_ptr().cast(), 1) };
    }
    Errno::set_raw(saved);
}

/// Shutdown request delivered through a self-pipe.
///
/// Once triggered the read end stays readable, so a request that arrives
/// while a connection is being served is seen by the next wait.
#[derive(Debug)]
pub struct ShutdownSignal {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl ShutdownSignal {
    pub fn new() -> Result<Self, Errno> {
        let (rx, tx) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(Self { rx, tx })
    }

    /// Route SIGTERM/SIGINT to this signal.
    ///
    /// `SA_RESTART` is not set, so a blocking receive returns `EINTR` and the
    /// request being served is answered before the loop stops.
    pub fn install_handlers(&self) -> Result<(), Errno> {
        WAKE_FD.store(self.tx.as_raw_fd(), Ordering::SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(on_terminate),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in [Signal::SIGTERM, Signal::SIGINT] {
            // SAFETY: the handler only calls write(2) on a pipe.
            unsafe { sigaction(signal, &action) }?;
        }
        Ok(())
    }

    pub fn trigger(&self) {
        match write(&self.tx, &[1]) {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(e) => warn!("Failed to signal shutdown: {e}"),
        }
    }

    pub fn is_triggered(&self) -> bool {
        let mut fds = [PollFd::new(self.rx.as_fd(), PollFlags::POLLIN)];
        matches!(poll(&mut fds, PollTimeout::ZERO), Ok(n) if n > 0)
    }
}

impl Drop for ShutdownSignal {
    fn drop(&mut self) {
        let _ = WAKE_FD.compare_exchange(
            self.tx.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// What woke [`Listener::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Incoming,
    Shutdown,
}

/// Listening socket. The socket file is unlinked on drop.
#[derive(Debug)]
pub struct Listener {
    fd: OwnedFd,
    path: PathBuf,
}

impl Listener {
    /// Bind `path`, replacing a stale socket file, and start listening.
    pub fn bind(path: &Path) -> Result<Self, TransportError> {
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove stale socket {}: {e}", path.display()),
        }

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(TransportError::Socket)?;

        let bind_err = |source| TransportError::Bind {
            path: path.to_path_buf(),
            source,
        };
        let addr = UnixAddr::new(path).map_err(bind_err)?;
        bind(fd.as_raw_fd(), &addr).map_err(bind_err)?;

        let listener = Self {
            fd,
            path: path.to_path_buf(),
        };

        fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE)).map_err(|source| {
            TransportError::Permissions {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let backlog = Backlog::new(BACKLOG).map_err(TransportError::Listen)?;
        listen(&listener.fd, backlog).map_err(TransportError::Listen)?;
        Ok(listener)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until a client is waiting or `shutdown` fires. Shutdown wins
    /// when both are ready.
    pub fn wait(&self, shutdown: &ShutdownSignal) -> Result<Readiness, TransportError> {
        loop {
            let mut fds = [
                PollFd::new(shutdown.rx.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.fd.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(TransportError::Poll(e)),
            }
            if fds[0].any().unwrap_or(true) {
                return Ok(Readiness::Shutdown);
            }
            if fds[1].any().unwrap_or(true) {
                return Ok(Readiness::Incoming);
            }
        }
    }

    /// Take a waiting client. The listener is non-blocking, so this fails
    /// with `Accept(EAGAIN)` when the client went away after [`wait`](Self::wait).
    pub fn accept(&self) -> Result<Connection, TransportError> {
        let raw = accept4(self.fd.as_raw_fd(), SockFlag::SOCK_CLOEXEC)
            .map_err(TransportError::Accept)?;
        // SAFETY: accept4 just returned this descriptor and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Connection {
            stream: UnixStream::from(fd),
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("Failed to remove socket {}: {e}", self.path.display());
        }
    }
}

/// One accepted client.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
}

impl Connection {
    /// Bound how long [`peek_ciphertext`](Self::peek_ciphertext) may block.
    /// `None` waits forever.
    pub fn set_peek_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.stream
            .set_read_timeout(timeout)
            .map_err(TransportError::Timeout)
    }

    /// Wait for `len` bytes without consuming them from the socket.
    pub fn peek_ciphertext(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; len];
        let got = recv(
            self.stream.as_raw_fd(),
            &mut buf,
            MsgFlags::MSG_PEEK | MsgFlags::MSG_WAITALL,
        )
        .map_err(TransportError::Peek)?;
        if got < len {
            return Err(TransportError::ShortRead { got, want: len });
        }
        Ok(buf)
    }

    /// Consume whatever the client has queued, then send the status,
    /// half-close and close the connection.
    ///
    /// Closing a unix socket with unread data resets the peer, which would
    /// make the client's read after the status fail.
    pub fn respond(self, status: Status) -> Result<(), TransportError> {
        let drained = drain(self.stream.as_raw_fd());
        debug!("Discarded {drained} request bytes");
        send(
            self.stream.as_raw_fd(),
            &status.to_wire(),
            MsgFlags::MSG_NOSIGNAL,
        )
        .map_err(TransportError::Send)?;
        if let Err(e) = self.stream.shutdown(Shutdown::Write) {
            debug!("Half-close failed: {e}");
        }
        Ok(())
    }
}

/// Read and drop queued bytes without blocking, up to [`MAX_DRAIN`].
fn drain(fd: RawFd) -> usize {
    let mut buf = [0u8; 4096];
    let mut total = 0;
    while total < MAX_DRAIN {
        match recv(fd, &mut buf, MsgFlags::MSG_DONTWAIT) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    total
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
