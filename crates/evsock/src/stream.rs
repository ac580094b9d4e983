//! Stream: an active socket with an overflow queue in front of its
//! bounded send queue
//!
//! [`Stream::send`] never reports a full socket queue. Packets wait in the
//! stream's own queue (bounded by `send_capacity`) and a contract on the
//! interface's send group moves them into the socket as room appears,
//! in FIFO order.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Arc;

use evsock_core::{ConnectError, Contract, SocketId};
use evsock_packet::Packet;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{SendError, SocketError};
use crate::reactor::Reactor;
use crate::socket::send_queue::DEFAULT_SEND_QUEUE_CAPACITY;
use crate::socket::{ActiveSocket, ActiveSocketConfig, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub socket: ActiveSocketConfig,
    /// Packets the stream holds beyond the socket's own queue
    pub send_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            socket: ActiveSocketConfig::default(),
            send_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
        }
    }
}

impl StreamConfig {
    pub fn from_env() -> Self {
        Self {
            socket: ActiveSocketConfig::from_env(),
            ..Self::default()
        }
    }

    pub fn socket(mut self, socket: ActiveSocketConfig) -> Self {
        self.socket = socket;
        self
    }

    pub fn send_capacity(mut self, capacity: usize) -> Self {
        self.send_capacity = capacity;
        self
    }
}

type Pending = (Packet, Option<SocketAddrV4>);

struct StreamInner {
    socket: ActiveSocket,
    pending: Mutex<VecDeque<Pending>>,
    send_capacity: usize,
    contract: Contract,
}

impl StreamInner {
    fn forward(&self, (packet, destination): Pending) -> Result<(), SendError> {
        match destination {
            Some(to) => self.socket.send_to(to, packet),
            None => self.socket.send(packet),
        }
    }

    /// Move pending packets into the socket until it pushes back
    fn drain(&self) {
        let mut pending = self.pending.lock();
        while let Some(next) = pending.pop_front() {
            let destination = next.1;
            match self.forward(next) {
                Ok(()) => {}
                Err(SendError::QueueFull(packet)) => {
                    pending.push_front((packet, destination));
                    self.contract.schedule();
                    return;
                }
                Err(e) => {
                    debug!(id = %self.socket.id(), dropped = pending.len() + 1, error = %e, "stream dropping pending sends");
                    pending.clear();
                    return;
                }
            }
        }
    }

    fn enqueue(&self, packet: Packet, destination: Option<SocketAddrV4>) -> Result<(), SendError> {
        if !self.socket.is_valid() {
            return Err(SendError::Closed(packet));
        }
        let mut pending = self.pending.lock();
        // Straight through while nothing is waiting ahead of us.
        let packet = if pending.is_empty() {
            match self.forward((packet, destination)) {
                Err(SendError::QueueFull(packet)) => packet,
                other => return other,
            }
        } else {
            packet
        };
        if pending.len() >= self.send_capacity {
            return Err(SendError::QueueFull(packet));
        }
        pending.push_back((packet, destination));
        drop(pending);
        self.contract.schedule();
        Ok(())
    }
}

pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn open(reactor: &Arc<Reactor>, socket: ActiveSocket, send_capacity: usize) -> Result<Self, SocketError> {
        let contract = reactor.send_group().reserve_contract()?;
        let inner = Arc::new(StreamInner {
            socket,
            pending: Mutex::new(VecDeque::new()),
            send_capacity: send_capacity.max(1),
            contract: contract.clone(),
        });
        let weak = Arc::downgrade(&inner);
        contract.bind(
            move || {
                if let Some(stream) = weak.upgrade() {
                    stream.drain();
                }
            },
            || {},
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> SocketId {
        self.inner.socket.id()
    }

    pub fn socket(&self) -> &ActiveSocket {
        &self.inner.socket
    }

    pub fn send(&self, packet: Packet) -> Result<(), SendError> {
        self.inner.enqueue(packet, None)
    }

    /// UDP only
    pub fn send_to(&self, destination: SocketAddrV4, packet: Packet) -> Result<(), SendError> {
        if self.inner.socket.transport() != Transport::Udp {
            return Err(SendError::Unsupported(packet));
        }
        self.inner.enqueue(packet, Some(destination))
    }

    /// Packets waiting in front of the socket's queue
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn connect_to(&self, destination: SocketAddrV4) -> Result<(), ConnectError> {
        self.inner.socket.connect_to(destination)
    }

    pub fn close(&self) -> bool {
        self.inner.pending.lock().clear();
        self.inner.socket.close()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.socket.is_valid()
    }

    pub fn local_address(&self) -> Option<SocketAddrV4> {
        self.inner.socket.local_address()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.socket.is_connected()
    }

    pub fn peer_address(&self) -> Option<SocketAddrV4> {
        self.inner.socket.peer_address()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.inner.contract.release();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("socket", &self.inner.socket)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::VirtualNetworkInterface;
    use crate::socket::{ActiveSocketHandlers, ListenerConfig, PassiveSocketHandlers};
    use evsock_core::PORT_ANY;
    use std::net::Ipv4Addr;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn pump_until(vni: &VirtualNetworkInterface, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            vni.poll_timeout(Duration::from_millis(1)).unwrap();
            for _ in 0..256 {
                if vni.service_sockets() == 0 {
                    break;
                }
            }
        }
        done()
    }

    #[test]
    fn test_overflow_preserves_order() {
        let vni = VirtualNetworkInterface::any().unwrap();
        let (tx, rx) = mpsc::channel();
        let handlers = ActiveSocketHandlers::new().on_receive(move |_, packet, _| {
            let _ = tx.send(packet[0]);
        });
        let config = StreamConfig::default()
            .socket(ActiveSocketConfig::default().send_queue_capacity(2))
            .send_capacity(16);
        let stream = vni.open_udp_stream(PORT_ANY, config, handlers).unwrap();
        let to = SocketAddrV4::new(Ipv4Addr::LOCALHOST, stream.local_address().unwrap().port());

        for i in 0..10u8 {
            stream.send_to(to, Packet::from(vec![i])).unwrap();
        }
        assert_eq!(stream.socket().pending_sends(), 2);
        assert_eq!(stream.pending(), 8);

        let mut got = Vec::new();
        assert!(pump_until(&vni, || {
            while let Ok(b) = rx.try_recv() {
                got.push(b);
            }
            got.len() == 10
        }));
        assert_eq!(got, (0..10u8).collect::<Vec<_>>());
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_overflow_is_bounded() {
        let vni = VirtualNetworkInterface::any().unwrap();
        let config = StreamConfig::default()
            .socket(ActiveSocketConfig::default().send_queue_capacity(1))
            .send_capacity(2);
        let stream = vni.open_udp_stream(PORT_ANY, config, ActiveSocketHandlers::new()).unwrap();
        let to = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
        for _ in 0..3 {
            stream.send_to(to, Packet::from("x")).unwrap();
        }
        match stream.send_to(to, Packet::from("fourth")) {
            Err(SendError::QueueFull(p)) => assert_eq!(&p[..], b"fourth"),
            other => panic!("expected QueueFull, got {other:?}"),
        }
    }

    #[test]
    fn test_tcp_stream() {
        let vni = VirtualNetworkInterface::any().unwrap();
        let (fd_tx, fd_rx) = mpsc::channel();
        let listener = vni
            .create_tcp_listener(
                ListenerConfig::default(),
                PassiveSocketHandlers::new().on_accept(move |_, fd| {
                    let _ = fd_tx.send(fd);
                }),
            )
            .unwrap();
        let remote = SocketAddrV4::new(Ipv4Addr::LOCALHOST, listener.port().unwrap());
        let stream = vni
            .open_tcp_stream(remote, StreamConfig::default(), ActiveSocketHandlers::new())
            .unwrap();
        assert!(stream.is_connected());
        assert_eq!(stream.peer_address(), Some(remote));
        assert!(matches!(
            stream.send_to(remote, Packet::from("x")),
            Err(SendError::Unsupported(_))
        ));

        let mut accepted = None;
        assert!(pump_until(&vni, || {
            if let Ok(fd) = fd_rx.try_recv() {
                accepted = Some(fd);
            }
            accepted.is_some()
        }));
        let (tx, rx) = mpsc::channel();
        let _server = vni
            .accept_tcp_socket(
                accepted.unwrap(),
                ActiveSocketConfig::default(),
                ActiveSocketHandlers::new().on_receive(move |_, packet, _| {
                    let _ = tx.send(packet.to_vec());
                }),
            )
            .unwrap();

        stream.send(Packet::from("hello ")).unwrap();
        stream.send(Packet::from("stream")).unwrap();
        let mut bytes = Vec::new();
        assert!(pump_until(&vni, || {
            while let Ok(chunk) = rx.try_recv() {
                bytes.extend(chunk);
            }
            bytes.len() >= 12
        }));
        assert_eq!(&bytes[..], b"hello stream");

        assert!(stream.close());
        assert!(!stream.is_valid());
        assert!(matches!(stream.send(Packet::from("late")), Err(SendError::Closed(_))));
    }
}
