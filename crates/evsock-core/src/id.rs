//! Socket identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for a socket
///
/// Ids are handed out from a single process-wide counter starting at 1 and
/// are never reused. Zero is reserved as the "no socket" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SocketId(u64);

impl SocketId {
    /// Sentinel value indicating no socket
    pub const NONE: SocketId = SocketId(0);

    /// Allocate the next id from the process-wide counter
    #[inline]
    pub fn next() -> Self {
        SocketId(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        SocketId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl From<SocketId> for u64 {
    #[inline]
    fn from(id: SocketId) -> Self {
        id.0
    }
}

impl fmt::Debug for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "SocketId(NONE)")
        } else {
            write!(f, "SocketId({})", self.0)
        }
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for SocketId {
    fn default() -> Self {
        SocketId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_socket_id_strictly_increasing() {
        let ids: Vec<SocketId> = (0..1000).map(|_| SocketId::next()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(ids.iter().all(|id| id.is_some()));
    }

    #[test]
    fn test_socket_id_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..500).map(|_| SocketId::next()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 2000);
    }

    #[test]
    fn test_socket_id_none() {
        assert!(SocketId::NONE.is_none());
        assert_eq!(SocketId::default(), SocketId::NONE);
        assert_eq!(format!("{}", SocketId::NONE), "none");
        assert_eq!(format!("{:?}", SocketId::new(7)), "SocketId(7)");
    }
}
