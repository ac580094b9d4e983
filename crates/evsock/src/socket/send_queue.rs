//! Bounded per-socket send queue
//!
//! Producers (any thread calling `send`) push into a lock-free bounded
//! queue. The socket's send contract is the only consumer: it moves the
//! oldest request into a head slot and makes one send attempt per
//! execution. Capacity counts queued plus in-flight requests.

use std::fmt;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use evsock_core::SocketId;
use evsock_packet::Packet;
use parking_lot::Mutex;

use super::Transport;
use crate::sys::is_transient_send_error;

pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1024;

/// Single-shot callback fired when a queued send finishes
///
/// TCP: every byte has been handed to the kernel. UDP: the datagram was
/// sent. A token whose send never finishes (socket closed first, or the
/// kernel rejected the request) is dropped without firing.
pub struct SendCompletionToken(Box<dyn FnOnce(SocketId) + Send>);

impl SendCompletionToken {
    pub fn new(f: impl FnOnce(SocketId) + Send + 'static) -> Self {
        SendCompletionToken(Box::new(f))
    }

    pub(crate) fn complete(self, id: SocketId) {
        (self.0)(id)
    }
}

impl fmt::Debug for SendCompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendCompletionToken")
    }
}

#[derive(Debug)]
pub(crate) struct SendRequest {
    pub packet: Packet,
    pub token: Option<SendCompletionToken>,
    /// UDP destination; `None` sends to the connected peer
    pub destination: Option<SocketAddrV4>,
}

/// What one execution of the send contract achieved
pub(crate) enum SendStep {
    /// Nothing queued
    Idle,
    /// Head request still pending; run again
    Retry,
    /// Head request finished
    Completed {
        token: Option<SendCompletionToken>,
        more: bool,
    },
    /// Head request rejected by the kernel and dropped
    Failed { code: i32, more: bool },
}

pub(crate) struct SendQueue {
    queue: ArrayQueue<SendRequest>,
    head: Mutex<Option<SendRequest>>,
    pending: AtomicUsize,
    capacity: usize,
}

impl SendQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: ArrayQueue::new(capacity),
            head: Mutex::new(None),
            pending: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Enqueue, or hand the request back if the queue is full
    pub(crate) fn push(&self, request: SendRequest) -> Result<(), SendRequest> {
        let reserved = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.capacity).then_some(n + 1))
            .is_ok();
        if !reserved {
            return Err(request);
        }
        self.queue.push(request).map_err(|request| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            request
        })
    }

    /// Queued plus in-flight requests
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// One send attempt on the head request
    ///
    /// `send` performs a single syscall and returns the bytes accepted or
    /// the `errno`. Stream sockets advance the packet window by the bytes
    /// accepted and finish once it is empty. Datagram sockets finish on
    /// the first successful send. Transient errors keep the head in place;
    /// any other error drops it.
    pub(crate) fn step<F>(&self, transport: Transport, mut send: F) -> SendStep
    where
        F: FnMut(&[u8], Option<SocketAddrV4>) -> Result<usize, i32>,
    {
        let mut head = self.head.lock();
        if head.is_none() {
            *head = self.queue.pop();
        }
        let Some(request) = head.as_mut() else {
            return SendStep::Idle;
        };

        match transport {
            Transport::Tcp => {
                if !request.packet.is_empty() {
                    match send(&request.packet[..], None) {
                        Ok(n) => {
                            request.packet.discard(n);
                            if !request.packet.is_empty() {
                                return SendStep::Retry;
                            }
                        }
                        Err(code) if is_transient_send_error(code) => return SendStep::Retry,
                        Err(code) => return self.drop_head(&mut head, code),
                    }
                }
            }
            Transport::Udp => match send(&request.packet[..], request.destination) {
                Ok(_) => {}
                Err(code) if is_transient_send_error(code) => return SendStep::Retry,
                Err(code) => return self.drop_head(&mut head, code),
            },
        }

        let finished = head.take();
        self.pending.fetch_sub(1, Ordering::AcqRel);
        SendStep::Completed {
            token: finished.and_then(|r| r.token),
            more: !self.queue.is_empty(),
        }
    }

    fn drop_head(&self, head: &mut Option<SendRequest>, code: i32) -> SendStep {
        *head = None;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        SendStep::Failed {
            code,
            more: !self.queue.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn request(bytes: &[u8], token: Option<SendCompletionToken>) -> SendRequest {
        SendRequest {
            packet: Packet::from(bytes),
            token,
            destination: None,
        }
    }

    fn counting_token(counter: &Arc<AtomicU32>) -> SendCompletionToken {
        let c = counter.clone();
        SendCompletionToken::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// Drive `step` the way the send contract does: one call per execution,
    /// rescheduling on Retry or when more requests remain.
    fn run_to_idle<F>(queue: &SendQueue, transport: Transport, mut send: F, fired: &Arc<AtomicU32>) -> usize
    where
        F: FnMut(&[u8], Option<SocketAddrV4>) -> Result<usize, i32>,
    {
        let mut executions = 0;
        loop {
            executions += 1;
            match queue.step(transport, &mut send) {
                SendStep::Idle => return executions - 1,
                SendStep::Retry => continue,
                SendStep::Completed { token, more } => {
                    if let Some(t) = token {
                        t.complete(SocketId::new(1));
                    }
                    if !more {
                        assert!(fired.load(Ordering::SeqCst) >= 1);
                        return executions;
                    }
                }
                SendStep::Failed { code, .. } => panic!("unexpected failure {code}"),
            }
        }
    }

    #[test]
    fn test_partial_send_convergence() {
        for (m, k) in [(10usize, 3usize), (4096, 1000), (7, 7), (1, 64), (1000, 1)] {
            let queue = SendQueue::new(4);
            let fired = Arc::new(AtomicU32::new(0));
            let payload: Vec<u8> = (0..m).map(|i| i as u8).collect();
            queue.push(request(&payload, Some(counting_token(&fired)))).unwrap();

            let mut wire = Vec::new();
            let executions = run_to_idle(
                &queue,
                Transport::Tcp,
                |data, _| {
                    let n = data.len().min(k);
                    wire.extend_from_slice(&data[..n]);
                    Ok(n)
                },
                &fired,
            );

            assert_eq!(executions, m.div_ceil(k), "m={m} k={k}");
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert_eq!(wire, payload);
            assert_eq!(queue.len(), 0);
        }
    }

    #[test]
    fn test_empty_tcp_packet_completes_without_syscall() {
        let queue = SendQueue::new(2);
        let fired = Arc::new(AtomicU32::new(0));
        queue.push(request(b"", Some(counting_token(&fired)))).unwrap();

        let mut calls = 0;
        let executions = run_to_idle(&queue, Transport::Tcp, |_, _| { calls += 1; Ok(0) }, &fired);
        assert_eq!(executions, 1);
        assert_eq!(calls, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_would_block_retries_in_place() {
        let queue = SendQueue::new(2);
        queue.push(request(b"abc", None)).unwrap();
        assert!(matches!(queue.step(Transport::Tcp, |_, _| Err(libc::EAGAIN)), SendStep::Retry));
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.step(Transport::Tcp, |d, _| Ok(d.len())), SendStep::Completed { more: false, .. }));
        assert!(matches!(queue.step(Transport::Tcp, |_, _| Ok(0)), SendStep::Idle));
    }

    #[test]
    fn test_tcp_hard_error_drops_head() {
        let queue = SendQueue::new(2);
        queue.push(request(b"abc", None)).unwrap();
        queue.push(request(b"def", None)).unwrap();
        assert!(matches!(
            queue.step(Transport::Tcp, |_, _| Err(libc::EPIPE)),
            SendStep::Failed { code: libc::EPIPE, more: true }
        ));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_udp_hard_error_drops_head_and_continues() {
        let queue = SendQueue::new(4);
        let fired = Arc::new(AtomicU32::new(0));
        let dest = SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 9);
        queue.push(request(b"no peer", Some(counting_token(&fired)))).unwrap();
        queue
            .push(SendRequest {
                packet: Packet::from("after"),
                token: Some(counting_token(&fired)),
                destination: Some(dest),
            })
            .unwrap();

        let step = queue.step(Transport::Udp, |_, to| {
            assert_eq!(to, None);
            Err(libc::EDESTADDRREQ)
        });
        assert!(matches!(step, SendStep::Failed { code: libc::EDESTADDRREQ, more: true }));
        assert_eq!(queue.len(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let mut sent = Vec::new();
        match queue.step(Transport::Udp, |data, to| {
            sent.push((data.to_vec(), to));
            Ok(data.len())
        }) {
            SendStep::Completed { token, more } => {
                assert!(!more);
                token.unwrap().complete(SocketId::new(1));
            }
            _ => panic!("second datagram not sent"),
        }
        assert_eq!(sent, vec![(b"after".to_vec(), Some(dest))]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_udp_transient_errors_retry() {
        for code in [libc::EAGAIN, libc::EINTR, libc::ENOBUFS] {
            let queue = SendQueue::new(2);
            queue.push(request(b"x", None)).unwrap();
            assert!(matches!(queue.step(Transport::Udp, |_, _| Err(code)), SendStep::Retry), "errno {code}");
            assert_eq!(queue.len(), 1);
        }
    }

    #[test]
    fn test_udp_retries_until_success() {
        let queue = SendQueue::new(2);
        let fired = Arc::new(AtomicU32::new(0));
        let dest = SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 9);
        queue
            .push(SendRequest {
                packet: Packet::from("dgram"),
                token: Some(counting_token(&fired)),
                destination: Some(dest),
            })
            .unwrap();

        let mut attempts = 0;
        let executions = run_to_idle(
            &queue,
            Transport::Udp,
            |data, to| {
                attempts += 1;
                assert_eq!(to, Some(dest));
                if attempts < 3 { Err(libc::ENOBUFS) } else { Ok(data.len()) }
            },
            &fired,
        );
        assert_eq!(executions, 3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fifo_and_capacity() {
        let queue = SendQueue::new(8);
        for i in 0..8u8 {
            queue.push(request(&[i], None)).unwrap();
        }
        let rejected = queue.push(request(b"overflow", None)).unwrap_err();
        assert_eq!(&rejected.packet[..], b"overflow");
        assert_eq!(queue.len(), 8);

        let mut order = Vec::new();
        while let SendStep::Completed { .. } = queue.step(Transport::Tcp, |d, _| {
            order.push(d[0]);
            Ok(d.len())
        }) {}
        assert_eq!(order, (0..8).collect::<Vec<u8>>());
    }
}
