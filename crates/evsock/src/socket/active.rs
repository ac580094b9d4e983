//! Active sockets: TCP connections and UDP endpoints
//!
//! Each active socket owns two work contracts. The receive contract runs
//! on the interface's receive group and performs exactly one `recv` /
//! `recvfrom` per execution. The send contract runs on the send group and
//! makes one send attempt on the head of the socket's send queue.

use std::fmt;
use std::net::{Ipv4Addr, Shutdown, SocketAddrV4};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use evsock_core::env::env_get;
use evsock_core::{is_valid_address, is_valid_ip, ConnectError, Contract, IoMode, SocketId, IP_ANY};
use evsock_packet::Packet;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::base::{self, SocketCore};
use super::handlers::ActiveSocketHandlers;
use super::send_queue::{SendCompletionToken, SendQueue, SendRequest, SendStep, DEFAULT_SEND_QUEUE_CAPACITY};
use super::{SocketEntry, Transport};
use crate::error::{SendError, SocketError};
use crate::reactor::Reactor;
use crate::sys;

pub const DEFAULT_TCP_READ_BUFFER_SIZE: usize = 4 * 1024;
pub const DEFAULT_UDP_READ_BUFFER_SIZE: usize = 2 * 1024;
pub const MAX_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Per-socket settings. Zero leaves a value at its default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSocketConfig {
    pub io_mode: IoMode,
    /// Bytes per receive; defaults to 4 KiB (TCP) or 2 KiB (UDP), capped at 64 KiB
    pub read_buffer_size: usize,
    /// `SO_RCVBUF`
    pub socket_receive_buffer_size: usize,
    /// `SO_SNDBUF`
    pub socket_send_buffer_size: usize,
    pub send_queue_capacity: usize,
    /// `IP_TTL`
    pub ttl: u32,
    /// `IP_MULTICAST_TTL`
    pub multicast_ttl: u32,
    /// `IP_MULTICAST_LOOP`
    pub multicast_loop: Option<bool>,
}

impl Default for ActiveSocketConfig {
    fn default() -> Self {
        Self {
            io_mode: IoMode::ReadWrite,
            read_buffer_size: 0,
            socket_receive_buffer_size: 0,
            socket_send_buffer_size: 0,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            ttl: 0,
            multicast_ttl: 0,
            multicast_loop: None,
        }
    }
}

impl ActiveSocketConfig {
    /// Read `EVSOCK_READ_BUFFER` and `EVSOCK_SEND_QUEUE`
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            read_buffer_size: env_get("EVSOCK_READ_BUFFER", d.read_buffer_size),
            send_queue_capacity: env_get("EVSOCK_SEND_QUEUE", d.send_queue_capacity),
            ..d
        }
    }

    pub fn io_mode(mut self, io_mode: IoMode) -> Self {
        self.io_mode = io_mode;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn socket_buffer_sizes(mut self, receive: usize, send: usize) -> Self {
        self.socket_receive_buffer_size = receive;
        self.socket_send_buffer_size = send;
        self
    }

    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn multicast_ttl(mut self, ttl: u32) -> Self {
        self.multicast_ttl = ttl;
        self
    }

    pub fn multicast_loop(mut self, enabled: bool) -> Self {
        self.multicast_loop = Some(enabled);
        self
    }

    fn effective_read_buffer_size(&self, transport: Transport) -> usize {
        match (transport, self.read_buffer_size) {
            (Transport::Tcp, 0) => DEFAULT_TCP_READ_BUFFER_SIZE,
            (Transport::Udp, 0) => DEFAULT_UDP_READ_BUFFER_SIZE,
            (_, n) => n.min(MAX_READ_BUFFER_SIZE),
        }
    }
}

/// Where the descriptor of a new active socket comes from
pub(crate) enum Origin {
    /// Open a new socket and bind it here
    Bind(SocketAddrV4),
    /// Wrap a descriptor returned by `accept`
    Accepted(OwnedFd),
}

pub(crate) struct ActiveInner {
    core: SocketCore,
    transport: Transport,
    interface_ip: Ipv4Addr,
    peer: Mutex<Option<SocketAddrV4>>,
    /// Multicast group joined via `join`
    membership: Mutex<Option<Ipv4Addr>>,
    read_buffer_size: usize,
    receive_contract: Contract,
    send_contract: Contract,
    send_queue: SendQueue,
    handlers: ActiveSocketHandlers,
    /// Contracts not yet released
    live_contracts: AtomicU32,
}

impl ActiveInner {
    pub(crate) fn open(
        reactor: &Arc<Reactor>,
        transport: Transport,
        origin: Origin,
        config: &ActiveSocketConfig,
        handlers: ActiveSocketHandlers,
    ) -> Result<ActiveSocket, SocketError> {
        // ── Step 1: contracts ──
        let receive_contract = reactor.receive_group().reserve_contract()?;
        let send_contract = match reactor.send_group().reserve_contract() {
            Ok(c) => c,
            Err(e) => {
                receive_contract.release();
                return Err(e.into());
            }
        };
        let abandon = |e: SocketError| {
            receive_contract.release();
            send_contract.release();
            e
        };

        // ── Step 2: descriptor ──
        let (fd, local, peer) = match origin {
            Origin::Bind(address) => {
                let fd = sys::open(transport).map_err(|c| abandon(SocketError::Open(c)))?;
                let local = base::configure(&fd, address, config.io_mode).map_err(abandon)?;
                (fd, local, None)
            }
            Origin::Accepted(fd) => {
                let local = base::configure_accepted(&fd, config.io_mode).map_err(abandon)?;
                let peer = sys::peer_address(fd.as_raw_fd()).ok();
                (fd, local, peer)
            }
        };

        let inner = Arc::new(ActiveInner {
            core: SocketCore::new(fd, Some(local), config.io_mode, handlers.close.clone(), handlers.poll_error.clone()),
            transport,
            interface_ip: reactor.ip(),
            peer: Mutex::new(peer),
            membership: Mutex::new(None),
            read_buffer_size: config.effective_read_buffer_size(transport),
            receive_contract: receive_contract.clone(),
            send_contract: send_contract.clone(),
            send_queue: SendQueue::new(config.send_queue_capacity),
            handlers,
            live_contracts: AtomicU32::new(2),
        });
        inner.apply_options(config);

        // ── Step 3: registry + contract callbacks ──
        let key = reactor.insert(SocketEntry::Active(inner.clone()));
        let weak = Arc::downgrade(&inner);
        receive_contract.bind(
            move || {
                if let Some(socket) = weak.upgrade() {
                    socket.receive();
                }
            },
            reactor.release_callback(key),
        );
        let weak = Arc::downgrade(&inner);
        send_contract.bind(
            move || {
                if let Some(socket) = weak.upgrade() {
                    socket.send_next();
                }
            },
            reactor.release_callback(key),
        );

        // ── Step 4: poller ──
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

        debug!(id = %inner.id(), ?transport, %local, ?peer, "active socket opened");
        Ok(ActiveSocket { inner })
    }

    fn apply_options(&self, config: &ActiveSocketConfig) {
        let core = &self.core;
        if config.socket_receive_buffer_size > 0 {
            core.apply_option(libc::SOL_SOCKET, libc::SO_RCVBUF, config.socket_receive_buffer_size as libc::c_int, "SO_RCVBUF");
        }
        if config.socket_send_buffer_size > 0 {
            core.apply_option(libc::SOL_SOCKET, libc::SO_SNDBUF, config.socket_send_buffer_size as libc::c_int, "SO_SNDBUF");
        }
        if config.ttl > 0 {
            core.apply_option(libc::IPPROTO_IP, libc::IP_TTL, config.ttl as libc::c_int, "IP_TTL");
        }
        if self.transport == Transport::Udp {
            if config.multicast_ttl > 0 {
                core.apply_option(libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, config.multicast_ttl as libc::c_int, "IP_MULTICAST_TTL");
            }
            if let Some(enabled) = config.multicast_loop {
                core.apply_option(libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, enabled as libc::c_int, "IP_MULTICAST_LOOP");
            }
            // Multicast egress follows the owning interface.
            if self.interface_ip != IP_ANY {
                core.apply_option(libc::IPPROTO_IP, libc::IP_MULTICAST_IF, sys::in_addr(self.interface_ip), "IP_MULTICAST_IF");
            }
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> SocketId {
        self.core.id()
    }

    #[inline]
    pub(crate) fn core(&self) -> &SocketCore {
        &self.core
    }

    #[inline]
    pub(crate) fn transport(&self) -> Transport {
        self.transport
    }

    pub(crate) fn on_polled(&self) {
        self.receive_contract.schedule();
    }

    pub(crate) fn on_hang_up(&self) {
        if let Some(f) = &self.handlers.hang_up {
            f(self.id());
        }
    }

    pub(crate) fn on_peer_hang_up(&self) {
        if let Some(f) = &self.handlers.peer_hang_up {
            f(self.id());
        }
    }

    fn peer(&self) -> Option<SocketAddrV4> {
        *self.peer.lock()
    }

    // ── Receive path ──────────────────────────────────────────────

    fn receive(&self) {
        let id = self.id();
        let mut packet = self.handlers.allocate(id, self.read_buffer_size);
        let want = packet.capacity().min(self.read_buffer_size);
        if want == 0 {
            self.receive_error(libc::ENOBUFS);
            return;
        }

        let transport = self.transport;
        let result = self.core.with_fd(|fd| {
            let buf = &mut packet.writable_mut()[..want];
            match transport {
                Transport::Tcp => sys::recv(fd, buf).map(|n| (n, None)),
                Transport::Udp => sys::recv_from(fd, buf).map(|(n, from)| (n, Some(from))),
            }
        });
        let Some(result) = result else {
            return;
        };

        match result {
            Ok((0, _)) if transport == Transport::Tcp => {
                debug!(%id, "peer closed connection");
                self.close();
            }
            Ok((n, from)) => {
                if packet.resize(n).is_err() {
                    return;
                }
                trace!(%id, bytes = n, "received");
                let from = from
                    .or_else(|| self.peer())
                    .unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
                if let Some(f) = &self.handlers.receive {
                    f(id, packet, from);
                }
                // Drain anything else already queued.
                self.receive_contract.schedule();
            }
            Err(code) if sys::is_would_block(code) => {}
            Err(libc::EINTR) => {
                self.receive_contract.schedule();
            }
            Err(libc::ECONNRESET) if transport == Transport::Tcp => {
                debug!(%id, "connection reset");
                self.close();
            }
            Err(code) => self.receive_error(code),
        }
    }

    fn receive_error(&self, code: i32) {
        trace!(id = %self.id(), errno = code, "receive error");
        if let Some(f) = &self.handlers.receive_error {
            f(self.id(), code);
        }
    }

    // ── Send path ─────────────────────────────────────────────────

    fn enqueue(&self, request: SendRequest) -> Result<(), SendError> {
        if !self.core.is_valid() || !self.send_contract.is_valid() {
            return Err(SendError::Closed(request.packet));
        }
        self.send_queue
            .push(request)
            .map_err(|rejected| SendError::QueueFull(rejected.packet))?;
        self.send_contract.schedule();
        Ok(())
    }

    fn send_next(&self) {
        let transport = self.transport;
        let step = self.send_queue.step(transport, |data, destination| {
            self.core
                .with_fd(|fd| match transport {
                    Transport::Tcp => sys::send(fd, data),
                    Transport::Udp => sys::send_to(fd, data, destination),
                })
                .unwrap_or(Err(libc::EBADF))
        });

        match step {
            SendStep::Idle => {}
            SendStep::Retry => {
                self.send_contract.schedule();
            }
            SendStep::Completed { token, more } => {
                if let Some(token) = token {
                    token.complete(self.id());
                }
                if more {
                    self.send_contract.schedule();
                }
            }
            SendStep::Failed { code, more } => match transport {
                Transport::Tcp => {
                    debug!(id = %self.id(), errno = code, "send failed");
                    self.close();
                }
                Transport::Udp => {
                    debug!(id = %self.id(), errno = code, "datagram dropped");
                    self.core.report_error(code);
                    if more {
                        self.send_contract.schedule();
                    }
                }
            },
        }
    }

    // ── Connection management ─────────────────────────────────────

    fn connect_to(&self, destination: SocketAddrV4) -> Result<(), ConnectError> {
        if !is_valid_address(destination) {
            return Err(ConnectError::InvalidDestination);
        }
        let mut peer = self.peer.lock();
        if peer.is_some() {
            return Err(ConnectError::AlreadyConnected);
        }
        self.core
            .with_fd(|fd| sys::connect(fd, destination))
            .ok_or(ConnectError::InvalidFileDescriptor)?
            .map_err(ConnectError::Os)?;
        *peer = Some(destination);
        debug!(id = %self.id(), %destination, "connect issued");
        Ok(())
    }

    fn join(&self, group: Ipv4Addr) -> Result<(), ConnectError> {
        if self.transport != Transport::Udp {
            return Err(ConnectError::Unsupported);
        }
        if !is_valid_ip(group) || !group.is_multicast() {
            return Err(ConnectError::InvalidDestination);
        }
        let mut peer = self.peer.lock();
        if peer.is_some() {
            return Err(ConnectError::AlreadyConnected);
        }
        let request = sys::membership(group, self.interface_ip);
        self.core
            .with_fd(|fd| sys::set_option(fd, libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP, request))
            .ok_or(ConnectError::InvalidFileDescriptor)?
            .map_err(ConnectError::Os)?;
        *peer = Some(SocketAddrV4::new(group, 0));
        *self.membership.lock() = Some(group);
        drop(peer);

        if let Err(e) = self.core.set_io_mode(IoMode::Read) {
            warn!(id = %self.id(), error = %e, "multicast receiver left writable");
        }
        debug!(id = %self.id(), %group, "joined multicast group");
        Ok(())
    }

    /// Drop multicast membership and forget the peer. False if there was
    /// nothing to disconnect.
    fn disconnect(&self) -> Result<bool, SocketError> {
        let mut peer = self.peer.lock();
        if peer.is_none() {
            return Ok(false);
        }
        if let Some(group) = *self.membership.lock() {
            let request = sys::membership(group, self.interface_ip);
            if let Some(Err(errno)) = self
                .core
                .with_fd(|fd| sys::set_option(fd, libc::IPPROTO_IP, libc::IP_DROP_MEMBERSHIP, request))
            {
                warn!(id = %self.id(), %group, errno, "failed to drop multicast membership");
                return Err(SocketError::SocketOption {
                    level: libc::IPPROTO_IP,
                    name: libc::IP_DROP_MEMBERSHIP,
                    errno,
                });
            }
        }
        *self.membership.lock() = None;
        *peer = None;
        Ok(true)
    }

    // ── Teardown ──────────────────────────────────────────────────

    fn close(&self) -> bool {
        let closed = self.core.close();
        self.destroy();
        closed
    }

    /// Release both contracts; retirement follows once neither can run
    fn destroy(&self) {
        self.receive_contract.release();
        self.send_contract.release();
    }

    pub(crate) fn contract_released(&self) -> bool {
        self.live_contracts.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn finalize(&self) {
        if self.membership.lock().is_some() {
            let _ = self.disconnect();
        }
        self.core.close();
    }
}

/// Handle to an active socket
///
/// Dropping the handle destroys the socket: its contracts are released
/// and the interface retires it on a later `service_sockets()`.
pub struct ActiveSocket {
    inner: Arc<ActiveInner>,
}

impl ActiveSocket {
    #[inline]
    pub fn id(&self) -> SocketId {
        self.inner.id()
    }

    #[inline]
    pub fn transport(&self) -> Transport {
        self.inner.transport
    }

    /// False once closed
    pub fn is_valid(&self) -> bool {
        self.inner.core.is_valid()
    }

    pub fn local_address(&self) -> Option<SocketAddrV4> {
        self.inner.core.local_address()
    }

    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        self.local_address().map(|a| *a.ip())
    }

    pub fn peer_address(&self) -> Option<SocketAddrV4> {
        self.inner.peer()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.peer().is_some()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.inner.core.raw_fd()
    }

    pub fn io_mode(&self) -> IoMode {
        self.inner.core.io_mode()
    }

    /// Issue a non-blocking connect. In-progress counts as success.
    pub fn connect_to(&self, destination: SocketAddrV4) -> Result<(), ConnectError> {
        self.inner.connect_to(destination)
    }

    /// Join a multicast group (UDP only). The socket becomes read-only and
    /// the group is recorded as its peer.
    pub fn join(&self, group: Ipv4Addr) -> Result<(), ConnectError> {
        self.inner.join(group)
    }

    pub fn disconnect(&self) -> Result<bool, SocketError> {
        self.inner.disconnect()
    }

    pub fn send(&self, packet: Packet) -> Result<(), SendError> {
        self.inner.enqueue(SendRequest {
            packet,
            token: None,
            destination: None,
        })
    }

    pub fn send_with_token(&self, packet: Packet, token: SendCompletionToken) -> Result<(), SendError> {
        self.inner.enqueue(SendRequest {
            packet,
            token: Some(token),
            destination: None,
        })
    }

    /// Send a datagram to `destination` (UDP only)
    pub fn send_to(&self, destination: SocketAddrV4, packet: Packet) -> Result<(), SendError> {
        self.send_to_inner(destination, packet, None)
    }

    pub fn send_to_with_token(
        &self,
        destination: SocketAddrV4,
        packet: Packet,
        token: SendCompletionToken,
    ) -> Result<(), SendError> {
        self.send_to_inner(destination, packet, Some(token))
    }

    fn send_to_inner(
        &self,
        destination: SocketAddrV4,
        packet: Packet,
        token: Option<SendCompletionToken>,
    ) -> Result<(), SendError> {
        if self.inner.transport != Transport::Udp {
            return Err(SendError::Unsupported(packet));
        }
        self.inner.enqueue(SendRequest {
            packet,
            token,
            destination: Some(destination),
        })
    }

    /// Sends queued or in flight
    pub fn pending_sends(&self) -> usize {
        self.inner.send_queue.len()
    }

    pub fn send_queue_capacity(&self) -> usize {
        self.inner.send_queue.capacity()
    }

    pub fn set_io_mode(&self, io_mode: IoMode) -> Result<(), SocketError> {
        self.inner.core.set_io_mode(io_mode)
    }

    pub fn set_read_only(&self) -> Result<(), SocketError> {
        self.set_io_mode(IoMode::Read)
    }

    pub fn set_write_only(&self) -> Result<(), SocketError> {
        self.set_io_mode(IoMode::Write)
    }

    pub fn set_read_write(&self) -> Result<(), SocketError> {
        self.set_io_mode(IoMode::ReadWrite)
    }

    /// Partial OS shutdown; the socket stays registered
    pub fn shutdown(&self, how: Shutdown) -> Result<(), SocketError> {
        self.inner.core.shutdown(how)
    }

    pub fn set_socket_option<T: Copy>(&self, level: i32, name: i32, value: T) -> Result<(), SocketError> {
        self.inner.core.set_option(level, name, value)
    }

    pub fn socket_option<T: Copy + Default>(&self, level: i32, name: i32) -> Result<T, SocketError> {
        self.inner.core.option(level, name)
    }

    /// Close the descriptor and start teardown. True for the call that
    /// actually closed.
    pub fn close(&self) -> bool {
        self.inner.close()
    }
}

impl Drop for ActiveSocket {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl fmt::Debug for ActiveSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSocket")
            .field("id", &self.id())
            .field("transport", &self.transport())
            .field("local", &self.local_address())
            .field("peer", &self.peer_address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_buffer_sizes() {
        let d = ActiveSocketConfig::default();
        assert_eq!(d.effective_read_buffer_size(Transport::Tcp), 4096);
        assert_eq!(d.effective_read_buffer_size(Transport::Udp), 2048);
        let big = d.read_buffer_size(1 << 20);
        assert_eq!(big.effective_read_buffer_size(Transport::Tcp), MAX_READ_BUFFER_SIZE);
        assert_eq!(big.effective_read_buffer_size(Transport::Udp), MAX_READ_BUFFER_SIZE);
        assert_eq!(d.read_buffer_size(1000).effective_read_buffer_size(Transport::Tcp), 1000);
    }

    #[test]
    fn test_config_builder() {
        let c = ActiveSocketConfig::default()
            .io_mode(IoMode::Read)
            .send_queue_capacity(8)
            .ttl(4)
            .multicast_ttl(2)
            .multicast_loop(true)
            .socket_buffer_sizes(1 << 16, 1 << 15);
        assert_eq!(c.io_mode, IoMode::Read);
        assert_eq!(c.send_queue_capacity, 8);
        assert_eq!(c.multicast_loop, Some(true));
        assert_eq!(c.socket_receive_buffer_size, 1 << 16);
    }
}
