//! State and setup shared by active and passive sockets

use std::net::{Shutdown, SocketAddrV4};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use evsock_core::{IoMode, SocketId};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::handlers::{CloseHandler, PollErrorHandler};
use crate::error::SocketError;
use crate::poller::PollerRegistration;
use crate::sys;

/// Bring a fresh descriptor into the reactor's standard state
///
/// `SO_REUSEADDR`, bind (skipped for a multicast address), non-blocking,
/// then the requested io mode. Returns the bound local address.
pub(crate) fn configure(fd: &OwnedFd, bind_to: SocketAddrV4, io_mode: IoMode) -> Result<SocketAddrV4, SocketError> {
    let raw = fd.as_raw_fd();
    sys::set_option::<libc::c_int>(raw, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1).map_err(SocketError::ReuseAddress)?;
    if !bind_to.ip().is_multicast() {
        sys::bind(raw, bind_to).map_err(SocketError::Bind)?;
    }
    let local = sys::local_address(raw).unwrap_or(bind_to);
    sys::set_nonblocking(raw).map_err(SocketError::NonBlocking)?;
    apply_io_mode(raw, io_mode).map_err(SocketError::IoMode)?;
    Ok(local)
}

/// Same as [`configure`] for a descriptor returned by `accept`
pub(crate) fn configure_accepted(fd: &OwnedFd, io_mode: IoMode) -> Result<SocketAddrV4, SocketError> {
    let raw = fd.as_raw_fd();
    sys::set_option::<libc::c_int>(raw, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1).map_err(SocketError::ReuseAddress)?;
    sys::set_nonblocking(raw).map_err(SocketError::NonBlocking)?;
    apply_io_mode(raw, io_mode).map_err(SocketError::IoMode)?;
    sys::local_address(raw).map_err(SocketError::Bind)
}

/// `Read` shuts down writes, `Write` shuts down reads, `None` both.
///
/// `ENOTCONN` is ignored: the kernel still records the shutdown on an
/// unconnected socket.
pub(crate) fn apply_io_mode(fd: RawFd, io_mode: IoMode) -> Result<(), i32> {
    let how = match io_mode {
        IoMode::ReadWrite => return Ok(()),
        IoMode::Read => libc::SHUT_WR,
        IoMode::Write => libc::SHUT_RD,
        IoMode::None => libc::SHUT_RDWR,
    };
    match sys::shutdown(fd, how) {
        Err(libc::ENOTCONN) => Ok(()),
        other => other,
    }
}

pub(crate) struct SocketCore {
    id: SocketId,
    fd: RwLock<Option<OwnedFd>>,
    local: Mutex<Option<SocketAddrV4>>,
    registration: Mutex<Option<PollerRegistration>>,
    io_mode: Mutex<IoMode>,
    closed: AtomicBool,
    on_close: Option<CloseHandler>,
    on_poll_error: Option<PollErrorHandler>,
}

impl SocketCore {
    pub(crate) fn new(
        fd: OwnedFd,
        local: Option<SocketAddrV4>,
        io_mode: IoMode,
        on_close: Option<CloseHandler>,
        on_poll_error: Option<PollErrorHandler>,
    ) -> Self {
        Self {
            id: SocketId::next(),
            fd: RwLock::new(Some(fd)),
            local: Mutex::new(local),
            registration: Mutex::new(None),
            io_mode: Mutex::new(io_mode),
            closed: AtomicBool::new(false),
            on_close,
            on_poll_error,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> SocketId {
        self.id
    }

    /// Run `f` with the descriptor held open; `None` once closed
    pub(crate) fn with_fd<R>(&self, f: impl FnOnce(RawFd) -> R) -> Option<R> {
        let guard = self.fd.read();
        guard.as_ref().map(|fd| f(fd.as_raw_fd()))
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.with_fd(|fd| fd)
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.fd.read().is_some()
    }

    pub(crate) fn local_address(&self) -> Option<SocketAddrV4> {
        *self.local.lock()
    }

    pub(crate) fn io_mode(&self) -> IoMode {
        *self.io_mode.lock()
    }

    pub(crate) fn attach(&self, registration: PollerRegistration) {
        *self.registration.lock() = Some(registration);
    }

    /// Close the descriptor and fire the close handler. True only for the
    /// call that actually closed.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Unregister while the descriptor number is still ours.
        if let Some(mut registration) = self.registration.lock().take() {
            if let Err(e) = registration.release() {
                warn!(id = %self.id, error = %e, "failed to unregister socket");
            }
        }
        drop(self.fd.write().take());
        *self.local.lock() = None;
        debug!(id = %self.id, "socket closed");
        if let Some(f) = &self.on_close {
            f(self.id);
        }
        true
    }

    pub(crate) fn poll_error(&self) {
        let code = self.with_fd(sys::take_error).unwrap_or(libc::EBADF);
        warn!(id = %self.id, errno = code, "poll error");
        self.report_error(code);
    }

    /// Hand an errno to the poll-error handler
    pub(crate) fn report_error(&self, code: i32) {
        if let Some(f) = &self.on_poll_error {
            f(self.id, code);
        }
    }

    pub(crate) fn set_io_mode(&self, io_mode: IoMode) -> Result<(), SocketError> {
        self.with_fd(|fd| apply_io_mode(fd, io_mode))
            .ok_or(SocketError::Closed)?
            .map_err(SocketError::IoMode)?;
        *self.io_mode.lock() = io_mode;
        Ok(())
    }

    pub(crate) fn shutdown(&self, how: Shutdown) -> Result<(), SocketError> {
        let (flag, mode) = match how {
            Shutdown::Read => (libc::SHUT_RD, IoMode::Write),
            Shutdown::Write => (libc::SHUT_WR, IoMode::Read),
            Shutdown::Both => (libc::SHUT_RDWR, IoMode::None),
        };
        match self.with_fd(|fd| sys::shutdown(fd, flag)).ok_or(SocketError::Closed)? {
            Ok(()) | Err(libc::ENOTCONN) => {}
            Err(code) => return Err(SocketError::IoMode(code)),
        }
        let mut current = self.io_mode.lock();
        *current = match (*current, mode) {
            (IoMode::ReadWrite, m) => m,
            (c, m) if c == m => c,
            _ => IoMode::None,
        };
        Ok(())
    }

    pub(crate) fn set_option<T: Copy>(&self, level: i32, name: i32, value: T) -> Result<(), SocketError> {
        self.with_fd(|fd| sys::set_option(fd, level, name, value))
            .ok_or(SocketError::Closed)?
            .map_err(|errno| SocketError::SocketOption { level, name, errno })
    }

    pub(crate) fn option<T: Copy + Default>(&self, level: i32, name: i32) -> Result<T, SocketError> {
        self.with_fd(|fd| sys::get_option(fd, level, name))
            .ok_or(SocketError::Closed)?
            .map_err(|errno| SocketError::SocketOption { level, name, errno })
    }

    /// Best-effort option; failures are logged
    pub(crate) fn apply_option<T: Copy>(&self, level: i32, name: i32, value: T, what: &'static str) {
        if let Err(e) = self.set_option(level, name, value) {
            warn!(id = %self.id, option = what, error = %e, "socket option not applied");
        }
    }
}
