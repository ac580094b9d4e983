//! Active and passive sockets
//!
//! A socket is owned by its interface's registry as a [`SocketEntry`];
//! the [`ActiveSocket`]/[`PassiveSocket`] values handed to callers are
//! handles onto the same state. Dropping a handle (or closing the socket)
//! releases the socket's work contracts; once every contract has been
//! released the interface retires the entry from inside
//! `service_sockets()`.

pub mod active;
pub mod base;
pub mod handlers;
pub mod passive;
pub mod send_queue;

use std::sync::Arc;

pub use active::{ActiveSocket, ActiveSocketConfig};
pub use handlers::{ActiveSocketHandlers, PassiveSocketHandlers};
pub use passive::{ListenerConfig, PassiveSocket};
pub use send_queue::SendCompletionToken;

use active::ActiveInner;
use evsock_core::SocketId;
use passive::PassiveInner;

/// Transport protocol of an active socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

/// A registry entry: every kind of socket the reactor drives
#[derive(Clone)]
pub(crate) enum SocketEntry {
    Active(Arc<ActiveInner>),
    Passive(Arc<PassiveInner>),
}

impl SocketEntry {
    pub(crate) fn id(&self) -> SocketId {
        match self {
            SocketEntry::Active(s) => s.id(),
            SocketEntry::Passive(s) => s.id(),
        }
    }

    pub(crate) fn on_polled(&self) {
        match self {
            SocketEntry::Active(s) => s.on_polled(),
            SocketEntry::Passive(s) => s.on_polled(),
        }
    }

    pub(crate) fn on_poll_error(&self) {
        match self {
            SocketEntry::Active(s) => s.core().poll_error(),
            SocketEntry::Passive(s) => s.core().poll_error(),
        }
    }

    pub(crate) fn on_hang_up(&self) {
        if let SocketEntry::Active(s) = self {
            s.on_hang_up();
        }
    }

    pub(crate) fn on_peer_hang_up(&self) {
        if let SocketEntry::Active(s) = self {
            s.on_peer_hang_up();
        }
    }

    /// Count one released contract; true once all of them are released
    pub(crate) fn contract_released(&self) -> bool {
        match self {
            SocketEntry::Active(s) => s.contract_released(),
            SocketEntry::Passive(s) => s.contract_released(),
        }
    }

    /// Final teardown after removal from the registry
    pub(crate) fn finalize(&self) {
        match self {
            SocketEntry::Active(s) => s.finalize(),
            SocketEntry::Passive(s) => s.finalize(),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            SocketEntry::Active(s) => match s.transport() {
                Transport::Tcp => "tcp",
                Transport::Udp => "udp",
            },
            SocketEntry::Passive(_) => "tcp-listener",
        }
    }
}
