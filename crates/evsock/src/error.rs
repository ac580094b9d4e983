//! Error types for the reactor

use evsock_core::error::{ConnectError, ContractError};
use evsock_packet::Packet;
use thiserror::Error;

/// Failures building or configuring a socket
///
/// OS-level variants carry the raw `errno`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("failed to open socket: os error {0}")]
    Open(i32),

    #[error("failed to set SO_REUSEADDR: os error {0}")]
    ReuseAddress(i32),

    #[error("failed to bind: os error {0}")]
    Bind(i32),

    #[error("failed to set non-blocking mode: os error {0}")]
    NonBlocking(i32),

    #[error("failed to apply io mode: os error {0}")]
    IoMode(i32),

    #[error("socket option {level}/{name} failed: os error {errno}")]
    SocketOption { level: i32, name: i32, errno: i32 },

    #[error("failed to listen: os error {0}")]
    Listen(i32),

    #[error("failed to register with poller: {0}")]
    Register(#[from] PollerError),

    #[error("no work contract available: {0}")]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("socket is closed")]
    Closed,
}

/// Errors from the readiness poller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollerError {
    #[error("epoll_create1 failed: os error {0}")]
    Create(i32),

    #[error("epoll_ctl on fd {fd} failed: os error {errno}")]
    Register { fd: i32, errno: i32 },

    #[error("epoll_wait failed: os error {0}")]
    Wait(i32),
}

/// A send that was not queued. The packet is handed back.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("send queue is full")]
    QueueFull(Packet),

    #[error("socket is closed")]
    Closed(Packet),

    #[error("operation not supported by this transport")]
    Unsupported(Packet),
}

impl SendError {
    /// Recover the packet that was not sent
    pub fn into_packet(self) -> Packet {
        match self {
            SendError::QueueFull(p) | SendError::Closed(p) | SendError::Unsupported(p) => p,
        }
    }

    pub fn packet(&self) -> &Packet {
        match self {
            SendError::QueueFull(p) | SendError::Closed(p) | SendError::Unsupported(p) => p,
        }
    }
}

/// Failures building or driving a virtual network interface
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterfaceError {
    #[error("no IPv4 network interface named {0:?}")]
    UnknownInterface(String),

    #[error("failed to enumerate network interfaces: os error {0}")]
    Enumerate(i32),

    #[error(transparent)]
    Poller(#[from] PollerError),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

impl From<ContractError> for InterfaceError {
    fn from(e: ContractError) -> Self {
        InterfaceError::Socket(SocketError::Contract(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_error_returns_packet() {
        let err = SendError::QueueFull(Packet::from("abc"));
        assert_eq!(err.to_string(), "send queue is full");
        assert_eq!(&err.packet()[..], b"abc");
        let p = err.into_packet();
        assert_eq!(&p[..], b"abc");
    }

    #[test]
    fn test_error_conversions() {
        let e: SocketError = ContractError::GroupFull.into();
        assert_eq!(e, SocketError::Contract(ContractError::GroupFull));
        let e: InterfaceError = PollerError::Create(24).into();
        assert_eq!(e.to_string(), "epoll_create1 failed: os error 24");
        let e: SocketError = ConnectError::AlreadyConnected.into();
        assert_eq!(e.to_string(), "socket is already connected");
    }
}
