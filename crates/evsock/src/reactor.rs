//! Shared state behind a virtual network interface
//!
//! Owns the poller, the socket registry and the contract groups. Sockets
//! reach it through a `Weak` held by their contract release callbacks.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use evsock_core::ContractGroup;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{PollerError, SocketError};
use crate::poller::{Poller, PollerRegistration, ReadinessHandler};
use crate::registry::{Registry, SocketKey};
use crate::socket::SocketEntry;

pub(crate) struct Reactor {
    ip: Ipv4Addr,
    poller: RwLock<Option<Arc<Poller>>>,
    registry: Registry<SocketEntry>,
    receive_group: ContractGroup,
    send_group: ContractGroup,
    shared_group: bool,
    stopped: AtomicBool,
}

impl Reactor {
    pub(crate) fn new(ip: Ipv4Addr, poller: Arc<Poller>, contract_capacity: usize, shared_group: bool) -> Self {
        let receive_group = ContractGroup::new(contract_capacity);
        let send_group = if shared_group {
            receive_group.clone()
        } else {
            ContractGroup::new(contract_capacity)
        };
        Self {
            ip,
            poller: RwLock::new(Some(poller)),
            registry: Registry::new(),
            receive_group,
            send_group,
            shared_group,
            stopped: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    #[inline]
    pub(crate) fn receive_group(&self) -> &ContractGroup {
        &self.receive_group
    }

    #[inline]
    pub(crate) fn send_group(&self) -> &ContractGroup {
        &self.send_group
    }

    #[inline]
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn socket_count(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn insert(&self, entry: SocketEntry) -> SocketKey {
        self.registry.insert(entry)
    }

    /// Drop an entry that never finished construction
    pub(crate) fn abandon(&self, key: SocketKey) {
        self.registry.remove(key);
    }

    pub(crate) fn register(&self, fd: RawFd, key: SocketKey) -> Result<PollerRegistration, SocketError> {
        let guard = self.poller.read();
        let poller = guard.as_ref().ok_or(SocketError::Closed)?;
        Ok(poller.register(fd, key.to_token())?)
    }

    /// Release callback for a socket's contracts
    pub(crate) fn release_callback(self: &Arc<Self>, key: SocketKey) -> impl FnOnce() + Send + 'static {
        let reactor: Weak<Self> = Arc::downgrade(self);
        move || {
            if let Some(reactor) = reactor.upgrade() {
                reactor.contract_released(key);
            }
        }
    }

    fn contract_released(&self, key: SocketKey) {
        let Some(entry) = self.registry.get(key) else {
            return;
        };
        if entry.contract_released() {
            self.registry.remove(key);
            entry.finalize();
            debug!(id = %entry.id(), kind = entry.kind(), ?key, "socket retired");
        }
    }

    pub(crate) fn poll(&self, timeout: Duration) -> Result<usize, PollerError> {
        let guard = self.poller.read();
        match guard.as_ref() {
            Some(poller) => poller.poll(timeout, self),
            None => Ok(0),
        }
    }

    /// Execute at most one ready contract from each group
    pub(crate) fn service(&self) -> usize {
        let mut executed = 0;
        if self.receive_group.execute_next_contract() {
            executed += 1;
        }
        if self.send_group.execute_next_contract() {
            executed += 1;
        }
        executed
    }

    /// Retire every socket, then drop the poller. True for the call that
    /// actually stopped.
    pub(crate) fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.receive_group.stop();
        if !self.shared_group {
            self.send_group.stop();
        }
        // Stopping the groups retires every socket whose contracts were
        // bound; anything left never finished construction.
        if !self.registry.is_empty() {
            for (key, entry) in self.registry.entries() {
                self.registry.remove(key);
                entry.finalize();
            }
        }
        // Waits for any in-flight poll().
        let poller = self.poller.write().take();
        drop(poller);
        debug!(ip = %self.ip, "reactor stopped");
        true
    }

    #[inline]
    fn lookup(&self, token: u64) -> Option<SocketEntry> {
        let entry = self.registry.get(SocketKey::from_token(token));
        if entry.is_none() {
            trace!(token, "readiness for retired socket");
        }
        entry
    }
}

impl ReadinessHandler for Reactor {
    fn on_poll_error(&self, token: u64) {
        if let Some(entry) = self.lookup(token) {
            entry.on_poll_error();
        }
    }

    fn on_polled(&self, token: u64) {
        if let Some(entry) = self.lookup(token) {
            entry.on_polled();
        }
    }

    fn on_hang_up(&self, token: u64) {
        if let Some(entry) = self.lookup(token) {
            entry.on_hang_up();
        }
    }

    fn on_peer_hang_up(&self, token: u64) {
        if let Some(entry) = self.lookup(token) {
            entry.on_peer_hang_up();
        }
    }
}
