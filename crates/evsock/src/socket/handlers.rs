//! Application callbacks attached to sockets
//!
//! Every callback receives the socket's id as its correlation key.
//! Handlers run on whichever thread calls `poll()` (poll-error, hang-up)
//! or `service_sockets()` (everything else).

use std::fmt;
use std::net::SocketAddrV4;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use evsock_core::SocketId;
use evsock_packet::Packet;

pub type CloseHandler = Arc<dyn Fn(SocketId) + Send + Sync>;
/// Receives the pending `SO_ERROR` code, or the errno of a dropped datagram
pub type PollErrorHandler = Arc<dyn Fn(SocketId, i32) + Send + Sync>;
/// Receives the packet and the address it came from
pub type ReceiveHandler = Arc<dyn Fn(SocketId, Packet, SocketAddrV4) + Send + Sync>;
pub type ReceiveErrorHandler = Arc<dyn Fn(SocketId, i32) + Send + Sync>;
/// Supplies the buffer for the next receive of at most `size` bytes
pub type PacketAllocationHandler = Arc<dyn Fn(SocketId, usize) -> Packet + Send + Sync>;
pub type HangUpHandler = Arc<dyn Fn(SocketId) + Send + Sync>;
/// Receives a freshly accepted, non-blocking descriptor
pub type AcceptHandler = Arc<dyn Fn(SocketId, OwnedFd) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ActiveSocketHandlers {
    pub close: Option<CloseHandler>,
    pub poll_error: Option<PollErrorHandler>,
    pub receive: Option<ReceiveHandler>,
    pub receive_error: Option<ReceiveErrorHandler>,
    pub packet_allocation: Option<PacketAllocationHandler>,
    pub hang_up: Option<HangUpHandler>,
    pub peer_hang_up: Option<HangUpHandler>,
}

impl ActiveSocketHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_close(mut self, f: impl Fn(SocketId) + Send + Sync + 'static) -> Self {
        self.close = Some(Arc::new(f));
        self
    }

    pub fn on_poll_error(mut self, f: impl Fn(SocketId, i32) + Send + Sync + 'static) -> Self {
        self.poll_error = Some(Arc::new(f));
        self
    }

    pub fn on_receive(mut self, f: impl Fn(SocketId, Packet, SocketAddrV4) + Send + Sync + 'static) -> Self {
        self.receive = Some(Arc::new(f));
        self
    }

    pub fn on_receive_error(mut self, f: impl Fn(SocketId, i32) + Send + Sync + 'static) -> Self {
        self.receive_error = Some(Arc::new(f));
        self
    }

    pub fn on_packet_allocation(mut self, f: impl Fn(SocketId, usize) -> Packet + Send + Sync + 'static) -> Self {
        self.packet_allocation = Some(Arc::new(f));
        self
    }

    pub fn on_hang_up(mut self, f: impl Fn(SocketId) + Send + Sync + 'static) -> Self {
        self.hang_up = Some(Arc::new(f));
        self
    }

    pub fn on_peer_hang_up(mut self, f: impl Fn(SocketId) + Send + Sync + 'static) -> Self {
        self.peer_hang_up = Some(Arc::new(f));
        self
    }

    /// Allocate a receive buffer, through the handler if one is set
    pub(crate) fn allocate(&self, id: SocketId, size: usize) -> Packet {
        match &self.packet_allocation {
            Some(f) => f(id, size),
            None => Packet::with_capacity(size),
        }
    }
}

impl fmt::Debug for ActiveSocketHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSocketHandlers")
            .field("close", &self.close.is_some())
            .field("poll_error", &self.poll_error.is_some())
            .field("receive", &self.receive.is_some())
            .field("receive_error", &self.receive_error.is_some())
            .field("packet_allocation", &self.packet_allocation.is_some())
            .field("hang_up", &self.hang_up.is_some())
            .field("peer_hang_up", &self.peer_hang_up.is_some())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct PassiveSocketHandlers {
    pub close: Option<CloseHandler>,
    pub poll_error: Option<PollErrorHandler>,
    pub accept: Option<AcceptHandler>,
}

impl PassiveSocketHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_close(mut self, f: impl Fn(SocketId) + Send + Sync + 'static) -> Self {
        self.close = Some(Arc::new(f));
        self
    }

    pub fn on_poll_error(mut self, f: impl Fn(SocketId, i32) + Send + Sync + 'static) -> Self {
        self.poll_error = Some(Arc::new(f));
        self
    }

    pub fn on_accept(mut self, f: impl Fn(SocketId, OwnedFd) + Send + Sync + 'static) -> Self {
        self.accept = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for PassiveSocketHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassiveSocketHandlers")
            .field("close", &self.close.is_some())
            .field("poll_error", &self.poll_error.is_some())
            .field("accept", &self.accept.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allocation() {
        let handlers = ActiveSocketHandlers::new();
        let p = handlers.allocate(SocketId::new(1), 512);
        assert_eq!(p.len(), 512);
    }

    #[test]
    fn test_custom_allocation() {
        let handlers = ActiveSocketHandlers::new().on_packet_allocation(|_, size| Packet::with_capacity(size / 2));
        assert_eq!(handlers.allocate(SocketId::new(1), 512).len(), 256);
        assert!(format!("{:?}", handlers).contains("packet_allocation: true"));
    }
}
