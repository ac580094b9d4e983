//! Readiness poller over epoll
//!
//! Each registration carries an opaque 64-bit token chosen by the caller.
//! [`Poller::poll`] drains up to `max_events` readiness events and hands
//! each token to a [`ReadinessHandler`]; it never performs I/O itself.
//!
//! Registrations keep the poller alive (`Arc<Poller>`), so a poller always
//! outlives every descriptor registered with it.

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("evsock's poller requires Linux epoll");
    }
}

use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use evsock_core::env::{env_flag, env_get};
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::error::PollerError;
use crate::sys::errno;

pub const DEFAULT_MAX_EVENTS: usize = 1024;

/// Edge- or level-triggered notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trigger {
    #[default]
    Edge,
    Level,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub trigger: Trigger,
    /// Events drained per `poll()` call
    pub max_events: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            trigger: Trigger::Edge,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

impl PollerConfig {
    /// Read `EVSOCK_EDGE_TRIGGERED` and `EVSOCK_POLL_BATCH`
    pub fn from_env() -> Self {
        Self {
            trigger: if env_flag("EVSOCK_EDGE_TRIGGERED", true) { Trigger::Edge } else { Trigger::Level },
            max_events: env_get("EVSOCK_POLL_BATCH", DEFAULT_MAX_EVENTS),
        }
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }
}

/// Readiness flags for one event
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness(u32);

impl Readiness {
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Readiness(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_error(self) -> bool {
        self.0 & libc::EPOLLERR as u32 != 0
    }

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.0 & libc::EPOLLIN as u32 != 0
    }

    #[inline]
    pub const fn is_hang_up(self) -> bool {
        self.0 & libc::EPOLLHUP as u32 != 0
    }

    #[inline]
    pub const fn is_peer_hang_up(self) -> bool {
        self.0 & libc::EPOLLRDHUP as u32 != 0
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("error", &self.is_error())
            .field("readable", &self.is_readable())
            .field("hang_up", &self.is_hang_up())
            .field("peer_hang_up", &self.is_peer_hang_up())
            .finish()
    }
}

/// Receiver of dispatched readiness, in error → readable → hang-up →
/// peer-hang-up order
///
/// An event with the error flag set dispatches only `on_poll_error`.
pub trait ReadinessHandler {
    fn on_poll_error(&self, token: u64);
    fn on_polled(&self, token: u64);
    fn on_hang_up(&self, token: u64);
    fn on_peer_hang_up(&self, token: u64);
}

pub struct Poller {
    epoll: OwnedFd,
    config: PollerConfig,
    events: Mutex<Vec<libc::epoll_event>>,
}

impl Poller {
    pub fn new(config: PollerConfig) -> Result<Arc<Self>, PollerError> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(PollerError::Create(errno()));
        }
        let max_events = config.max_events.max(1);
        let empty = libc::epoll_event { events: 0, u64: 0 };
        Ok(Arc::new(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            config: PollerConfig { max_events, ..config },
            events: Mutex::new(vec![empty; max_events]),
        }))
    }

    #[inline]
    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    fn interest(&self) -> u32 {
        let mut bits = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        if self.config.trigger == Trigger::Edge {
            bits |= libc::EPOLLET as u32;
        }
        bits
    }

    /// Add `fd` to the notification set, tagged with `token`
    pub fn register(self: &Arc<Self>, fd: RawFd, token: u64) -> Result<PollerRegistration, PollerError> {
        let mut event = libc::epoll_event {
            events: self.interest(),
            u64: token,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if ret != 0 {
            return Err(PollerError::Register { fd, errno: errno() });
        }
        trace!(fd, token, "poller registered");
        Ok(PollerRegistration {
            poller: Arc::clone(self),
            fd,
            registered: true,
        })
    }

    fn unregister(&self, fd: RawFd) -> Result<(), PollerError> {
        let ret = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret != 0 {
            let code = errno();
            // Already gone counts as success.
            if code != libc::ENOENT && code != libc::EBADF {
                return Err(PollerError::Register { fd, errno: code });
            }
        }
        trace!(fd, "poller unregistered");
        Ok(())
    }

    /// Wait up to `timeout` (zero: don't wait) and dispatch ready events.
    /// Returns the number of events dispatched.
    pub fn poll<H>(&self, timeout: Duration, handler: &H) -> Result<usize, PollerError>
    where
        H: ReadinessHandler + ?Sized,
    {
        let mut events = self.events.lock();
        let timeout_ms = timeout_millis(timeout);
        let n = unsafe {
            libc::epoll_wait(self.epoll.as_raw_fd(), events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };
        if n < 0 {
            let code = errno();
            if code == libc::EINTR {
                return Ok(0);
            }
            error!(errno = code, "epoll_wait failed");
            return Err(PollerError::Wait(code));
        }

        for event in events.iter().take(n as usize) {
            let token = event.u64;
            let readiness = Readiness(event.events);
            trace!(token, ?readiness, "readiness");
            if readiness.is_error() {
                handler.on_poll_error(token);
                continue;
            }
            if readiness.is_readable() {
                handler.on_polled(token);
            }
            if readiness.is_hang_up() {
                handler.on_hang_up(token);
            }
            if readiness.is_peer_hang_up() {
                handler.on_peer_hang_up(token);
            }
        }
        Ok(n as usize)
    }
}

/// `epoll_wait` timeout: whole milliseconds rounded up, clamped to `i32::MAX`
fn timeout_millis(timeout: Duration) -> i32 {
    let millis = timeout.as_nanos().div_ceil(1_000_000);
    millis.min(i32::MAX as u128) as i32
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("epoll", &self.epoll.as_raw_fd())
            .field("config", &self.config)
            .finish()
    }
}

/// A descriptor's membership in a poller's notification set
///
/// Released explicitly with [`release`](PollerRegistration::release) or on
/// drop. Releasing twice is a no-op.
pub struct PollerRegistration {
    poller: Arc<Poller>,
    fd: RawFd,
    registered: bool,
}

impl PollerRegistration {
    pub fn release(&mut self) -> Result<(), PollerError> {
        if !std::mem::take(&mut self.registered) {
            return Ok(());
        }
        self.poller.unregister(self.fd)
    }

    #[inline]
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for PollerRegistration {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl fmt::Debug for PollerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollerRegistration")
            .field("fd", &self.fd)
            .field("registered", &self.registered)
            .finish()
    }
}
