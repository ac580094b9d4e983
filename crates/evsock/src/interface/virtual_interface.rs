//! Virtual network interface
//!
//! The composition root of the reactor. A `VirtualNetworkInterface` is
//! bound to one local IPv4 address (a named physical interface, or "any")
//! and owns:
//!
//! - one [`Poller`], pumped by [`VirtualNetworkInterface::poll`]
//! - a receive and a send contract group (optionally one shared group),
//!   pumped by [`VirtualNetworkInterface::service_sockets`]
//! - the registry of every socket created through its factories
//!
//! Nothing here spawns a thread. The embedding application drives the
//! interface from its own threads:
//!
//! ```no_run
//! use evsock::{ActiveSocketConfig, ActiveSocketHandlers, VirtualNetworkInterface};
//!
//! let vni = VirtualNetworkInterface::any()?;
//! let handlers = ActiveSocketHandlers::new().on_receive(|id, packet, from| {
//!     println!("{id}: {} bytes from {from}", packet.len());
//! });
//! let _socket = vni.create_udp_socket(9000, ActiveSocketConfig::default(), handlers)?;
//! loop {
//!     vni.poll()?;
//!     while vni.service_sockets() > 0 {}
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use evsock_core::env::{env_flag, env_get, env_get_string};
use evsock_core::{IP_ANY, PORT_ANY};
use tracing::debug;

use super::enumerate::find_network_interface;
use crate::error::{InterfaceError, SocketError};
use crate::poller::{Poller, PollerConfig};
use crate::reactor::Reactor;
use crate::socket::active::{ActiveInner, Origin};
use crate::socket::passive::PassiveInner;
use crate::socket::{
    ActiveSocket, ActiveSocketConfig, ActiveSocketHandlers, ListenerConfig, PassiveSocket, PassiveSocketHandlers,
    Transport,
};
use crate::stream::{Stream, StreamConfig};

pub const DEFAULT_CONTRACT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Physical interface to bind; `None` binds the "any" address
    pub physical_interface: Option<String>,
    pub poller: PollerConfig,
    /// Contracts per group
    pub contract_capacity: usize,
    /// Run sends and receives from one contract group
    pub shared_contract_group: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            physical_interface: None,
            poller: PollerConfig::default(),
            contract_capacity: DEFAULT_CONTRACT_CAPACITY,
            shared_contract_group: false,
        }
    }
}

impl InterfaceConfig {
    /// Read `EVSOCK_INTERFACE`, `EVSOCK_CONTRACT_CAPACITY`,
    /// `EVSOCK_SHARED_GROUP` and the poller variables
    pub fn from_env() -> Self {
        Self {
            physical_interface: env_get_string("EVSOCK_INTERFACE"),
            poller: PollerConfig::from_env(),
            contract_capacity: env_get("EVSOCK_CONTRACT_CAPACITY", DEFAULT_CONTRACT_CAPACITY),
            shared_contract_group: env_flag("EVSOCK_SHARED_GROUP", false),
        }
    }

    pub fn physical_interface(mut self, name: impl Into<String>) -> Self {
        self.physical_interface = Some(name.into());
        self
    }

    pub fn poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn contract_capacity(mut self, capacity: usize) -> Self {
        self.contract_capacity = capacity;
        self
    }

    pub fn shared_contract_group(mut self, shared: bool) -> Self {
        self.shared_contract_group = shared;
        self
    }
}

pub struct VirtualNetworkInterface {
    reactor: Arc<Reactor>,
    name: Option<String>,
    loopback: bool,
}

impl VirtualNetworkInterface {
    pub fn new(config: InterfaceConfig) -> Result<Self, InterfaceError> {
        let (ip, loopback) = match &config.physical_interface {
            None => (IP_ANY, false),
            Some(name) => {
                let info = find_network_interface(name)?.ok_or_else(|| InterfaceError::UnknownInterface(name.clone()))?;
                (info.ip, info.loopback)
            }
        };
        let poller = Poller::new(config.poller)?;
        let reactor = Arc::new(Reactor::new(
            ip,
            poller,
            config.contract_capacity,
            config.shared_contract_group,
        ));
        debug!(
            %ip,
            name = config.physical_interface.as_deref().unwrap_or("any"),
            shared_group = config.shared_contract_group,
            "virtual interface created"
        );
        Ok(Self {
            reactor,
            name: config.physical_interface,
            loopback,
        })
    }

    /// Bound to the "any" address
    pub fn any() -> Result<Self, InterfaceError> {
        Self::new(InterfaceConfig::default())
    }

    /// Bound to the first IPv4 address of a physical interface
    pub fn with_interface(name: impl Into<String>) -> Result<Self, InterfaceError> {
        Self::new(InterfaceConfig::default().physical_interface(name))
    }

    pub fn ip_address(&self) -> Ipv4Addr {
        self.reactor.ip()
    }

    /// Physical interface name; `None` for "any"
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_loopback(&self) -> bool {
        self.loopback
    }

    /// False once stopped
    pub fn is_valid(&self) -> bool {
        !self.reactor.is_stopped()
    }

    /// Sockets not yet retired
    pub fn socket_count(&self) -> usize {
        self.reactor.socket_count()
    }

    fn local(&self, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(self.reactor.ip(), port)
    }

    // ── Factories ─────────────────────────────────────────────────

    pub fn create_tcp_listener(
        &self,
        config: ListenerConfig,
        handlers: PassiveSocketHandlers,
    ) -> Result<PassiveSocket, SocketError> {
        PassiveInner::open(&self.reactor, &config, handlers)
    }

    /// Wrap a descriptor handed to a listener's accept handler
    pub fn accept_tcp_socket(
        &self,
        fd: OwnedFd,
        config: ActiveSocketConfig,
        handlers: ActiveSocketHandlers,
    ) -> Result<ActiveSocket, SocketError> {
        ActiveInner::open(&self.reactor, Transport::Tcp, Origin::Accepted(fd), &config, handlers)
    }

    /// Open a TCP socket on an ephemeral port and start connecting to
    /// `remote`. The connect completes asynchronously.
    pub fn connect_tcp_socket(
        &self,
        remote: SocketAddrV4,
        config: ActiveSocketConfig,
        handlers: ActiveSocketHandlers,
    ) -> Result<ActiveSocket, SocketError> {
        let socket = ActiveInner::open(
            &self.reactor,
            Transport::Tcp,
            Origin::Bind(self.local(PORT_ANY)),
            &config,
            handlers,
        )?;
        socket.connect_to(remote)?;
        Ok(socket)
    }

    /// Connectionless UDP socket on `port` (`PORT_ANY` for ephemeral)
    pub fn create_udp_socket(
        &self,
        port: u16,
        config: ActiveSocketConfig,
        handlers: ActiveSocketHandlers,
    ) -> Result<ActiveSocket, SocketError> {
        ActiveInner::open(&self.reactor, Transport::Udp, Origin::Bind(self.local(port)), &config, handlers)
    }

    /// UDP socket on an ephemeral port connected to `destination`
    pub fn connect_udp_socket(
        &self,
        destination: SocketAddrV4,
        config: ActiveSocketConfig,
        handlers: ActiveSocketHandlers,
    ) -> Result<ActiveSocket, SocketError> {
        let socket = self.create_udp_socket(PORT_ANY, config, handlers)?;
        socket.connect_to(destination)?;
        Ok(socket)
    }

    /// Receive-only UDP socket bound to `group`'s port on the any address
    /// and joined to `group` on this interface
    pub fn multicast_join(
        &self,
        group: SocketAddrV4,
        config: ActiveSocketConfig,
        handlers: ActiveSocketHandlers,
    ) -> Result<ActiveSocket, SocketError> {
        let socket = ActiveInner::open(
            &self.reactor,
            Transport::Udp,
            Origin::Bind(SocketAddrV4::new(IP_ANY, group.port())),
            &config,
            handlers,
        )?;
        socket.join(*group.ip())?;
        Ok(socket)
    }

    pub fn open_tcp_stream(
        &self,
        remote: SocketAddrV4,
        config: StreamConfig,
        handlers: ActiveSocketHandlers,
    ) -> Result<Stream, SocketError> {
        let socket = self.connect_tcp_socket(remote, config.socket, handlers)?;
        Stream::open(&self.reactor, socket, config.send_capacity)
    }

    pub fn open_udp_stream(
        &self,
        port: u16,
        config: StreamConfig,
        handlers: ActiveSocketHandlers,
    ) -> Result<Stream, SocketError> {
        let socket = self.create_udp_socket(port, config.socket, handlers)?;
        Stream::open(&self.reactor, socket, config.send_capacity)
    }

    // ── Pump ──────────────────────────────────────────────────────

    /// Dispatch ready events without waiting
    pub fn poll(&self) -> Result<usize, InterfaceError> {
        self.poll_timeout(Duration::ZERO)
    }

    /// Wait up to `timeout` for readiness, then dispatch. Returns the
    /// number of events; 0 after `stop()`.
    pub fn poll_timeout(&self, timeout: Duration) -> Result<usize, InterfaceError> {
        Ok(self.reactor.poll(timeout)?)
    }

    /// Execute at most one ready contract from each group
    pub fn service_sockets(&self) -> usize {
        self.reactor.service()
    }

    /// Retire every socket and drop the poller. Idempotent; true for the
    /// call that actually stopped.
    pub fn stop(&self) -> bool {
        self.reactor.stop()
    }
}

impl Drop for VirtualNetworkInterface {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for VirtualNetworkInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualNetworkInterface")
            .field("ip", &self.ip_address())
            .field("name", &self.name)
            .field("sockets", &self.socket_count())
            .field("valid", &self.is_valid())
            .finish()
    }
}
