//! Passive (listening) TCP sockets
//!
//! A listener owns one contract on the receive group. Each execution
//! accepts at most one connection and hands the new descriptor to the
//! accept handler; the caller wraps it with
//! `VirtualNetworkInterface::accept_tcp_socket`.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use evsock_core::{Contract, IoMode, SocketId, PORT_ANY};
use tracing::{debug, trace, warn};

use super::base::{self, SocketCore};
use super::handlers::PassiveSocketHandlers;
use super::{SocketEntry, Transport};
use crate::error::SocketError;
use crate::reactor::Reactor;
use crate::sys;

pub const DEFAULT_BACKLOG: i32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Port to listen on; `PORT_ANY` picks an ephemeral one
    pub port: u16,
    pub backlog: i32,
    pub io_mode: IoMode,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: PORT_ANY,
            backlog: DEFAULT_BACKLOG,
            io_mode: IoMode::ReadWrite,
        }
    }
}

impl ListenerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn io_mode(mut self, io_mode: IoMode) -> Self {
        self.io_mode = io_mode;
        self
    }
}

pub(crate) struct PassiveInner {
    core: SocketCore,
    accept_contract: Contract,
    handlers: PassiveSocketHandlers,
    live_contracts: AtomicU32,
}

impl PassiveInner {
    pub(crate) fn open(
        reactor: &Arc<Reactor>,
        config: &ListenerConfig,
        handlers: PassiveSocketHandlers,
    ) -> Result<PassiveSocket, SocketError> {
        let accept_contract = reactor.receive_group().reserve_contract()?;
        let abandon = |e: SocketError| {
            accept_contract.release();
            e
        };

        let fd = sys::open(Transport::Tcp).map_err(|c| abandon(SocketError::Open(c)))?;
        let local = base::configure(&fd, SocketAddrV4::new(reactor.ip(), config.port), config.io_mode).map_err(abandon)?;
        sys::listen(fd.as_raw_fd(), config.backlog)
            .map_err(|c| abandon(SocketError::Listen(c)))?;

        let inner = Arc::new(PassiveInner {
            core: SocketCore::new(fd, Some(local), config.io_mode, handlers.close.clone(), handlers.poll_error.clone()),
            accept_contract: accept_contract.clone(),
            handlers,
            live_contracts: AtomicU32::new(1),
        });

        let key = reactor.insert(SocketEntry::Passive(inner.clone()));
        let weak = Arc::downgrade(&inner);
        accept_contract.bind(
            move || {
                if let Some(listener) = weak.upgrade() {
                    listener.accept();
                }
            },
            reactor.release_callback(key),
        );

        let Some(raw) = inner.core.raw_fd() else {
            reactor.abandon(key);
            return Err(abandon(SocketError::Closed));
        };
        match reactor.register(raw, key) {
            Ok(registration) => inner.core.attach(registration),
            Err(e) => {
                reactor.abandon(key);
                return Err(abandon(e));
            }
        }

        debug!(id = %inner.id(), %local, backlog = config.backlog, "listener opened");
        Ok(PassiveSocket { inner })
    }

    #[inline]
    pub(crate) fn id(&self) -> SocketId {
        self.core.id()
    }

    #[inline]
    pub(crate) fn core(&self) -> &SocketCore {
        &self.core
    }

    pub(crate) fn on_polled(&self) {
        self.accept_contract.schedule();
    }

    fn accept(&self) {
        let Some(result) = self.core.with_fd(sys::accept) else {
            return;
        };
        match result {
            Ok(Some(fd)) => {
                trace!(id = %self.id(), "connection accepted");
                match &self.handlers.accept {
                    Some(f) => f(self.id(), fd),
                    None => drop(fd),
                }
                // The backlog may hold more.
                self.accept_contract.schedule();
            }
            Ok(None) => {}
            Err(libc::EINTR) | Err(libc::ECONNABORTED) => {
                self.accept_contract.schedule();
            }
            Err(code) => {
                warn!(id = %self.id(), errno = code, "accept failed");
                if let Some(f) = &self.handlers.poll_error {
                    f(self.id(), code);
                }
            }
        }
    }

    fn close(&self) -> bool {
        let closed = self.core.close();
        self.destroy();
        closed
    }

    fn destroy(&self) {
        self.accept_contract.release();
    }

    pub(crate) fn contract_released(&self) -> bool {
        self.live_contracts.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn finalize(&self) {
        self.core.close();
    }
}

/// Handle to a listening socket; dropping it destroys the listener
pub struct PassiveSocket {
    inner: Arc<PassiveInner>,
}

impl PassiveSocket {
    #[inline]
    pub fn id(&self) -> SocketId {
        self.inner.id()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.core.is_valid()
    }

    pub fn local_address(&self) -> Option<SocketAddrV4> {
        self.inner.core.local_address()
    }

    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        self.local_address().map(|a| *a.ip())
    }

    pub fn port(&self) -> Option<u16> {
        self.local_address().map(|a| a.port())
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.inner.core.raw_fd()
    }

    pub fn set_socket_option<T: Copy>(&self, level: i32, name: i32, value: T) -> Result<(), SocketError> {
        self.inner.core.set_option(level, name, value)
    }

    pub fn socket_option<T: Copy + Default>(&self, level: i32, name: i32) -> Result<T, SocketError> {
        self.inner.core.option(level, name)
    }

    pub fn close(&self) -> bool {
        self.inner.close()
    }
}

impl Drop for PassiveSocket {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl fmt::Debug for PassiveSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassiveSocket")
            .field("id", &self.id())
            .field("local", &self.local_address())
            .finish()
    }
}
