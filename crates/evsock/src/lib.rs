//! # evsock
//!
//! Pull-driven socket reactor over Linux epoll.
//!
//! A [`VirtualNetworkInterface`] owns a poller and its contract groups and
//! creates sockets bound to one local address. The application drives it
//! from its own threads: `poll()` turns readiness into scheduled work,
//! `service_sockets()` runs that work (one receive, one send attempt or one
//! accept per contract execution) and invokes the socket handlers.
//!
//! ## Modules
//!
//! - `poller` - epoll registration and readiness dispatch
//! - `socket` - active (TCP/UDP) and passive (listening) sockets
//! - `stream` - active socket with an overflow send queue
//! - `interface` - interface enumeration and `VirtualNetworkInterface`
//! - `error` - socket, poller, send and interface errors

pub mod error;
pub mod interface;
pub mod poller;
pub mod socket;
pub mod stream;

mod reactor;
mod registry;
mod sys;

pub use error::{InterfaceError, PollerError, SendError, SocketError};
pub use interface::{
    find_network_interface, network_interfaces, InterfaceConfig, NetworkInterfaceInfo, VirtualNetworkInterface,
};
pub use poller::{Poller, PollerConfig, PollerRegistration, Readiness, ReadinessHandler, Trigger};
pub use socket::{
    ActiveSocket, ActiveSocketConfig, ActiveSocketHandlers, ListenerConfig, PassiveSocket, PassiveSocketHandlers,
    SendCompletionToken, Transport,
};
pub use stream::{Stream, StreamConfig};

pub use evsock_core::{is_valid_address, is_valid_ip, ConnectError, IoMode, SocketId, IP_ANY, IP_NONE, PORT_ANY};
pub use evsock_packet::{BufferHeap, BufferHeapConfig, Packet};
