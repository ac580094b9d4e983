//! A self-releasing view over a byte buffer
//!
//! A packet owns (or borrows) a span of memory and exposes a logical
//! window `[begin, begin + len)` into it. The window can be shrunk from
//! the front with [`discard`](Packet::discard) and resized within the span
//! with [`resize`](Packet::resize); neither reallocates.
//!
//! Exactly one release action fires when the packet is dropped:
//!
//! | Origin                      | Release                               |
//! |-----------------------------|---------------------------------------|
//! | `with_capacity`, `From<…>`  | free the owned allocation             |
//! | `from_heap`                 | return the buffer to its `BufferHeap` |
//! | `with_release`              | hand the buffer to the callback       |
//! | `from_raw_parts`            | nothing (borrowed)                    |

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::buffer_heap::BufferHeap;
use crate::error::PacketError;

type ReleaseCallback = Box<dyn FnOnce(Box<[u8]>) + Send>;

enum Release {
    Borrowed,
    Heap { heap: Arc<BufferHeap>, index: u32 },
    Owned,
    Callback(ReleaseCallback),
}

pub struct Packet {
    ptr: NonNull<u8>,
    /// Length of the whole span
    span: usize,
    begin: usize,
    len: usize,
    release: Release,
}

// SAFETY: the span is either owned by this packet, exclusively checked out
// of a BufferHeap, or borrowed under the contract of `from_raw_parts`.
unsafe impl Send for Packet {}
unsafe impl Sync for Packet {}

impl Packet {
    /// Allocate a zeroed packet of `size` bytes
    pub fn with_capacity(size: usize) -> Self {
        Self::from_box(vec![0u8; size].into_boxed_slice(), None)
    }

    /// Draw a buffer from `heap`, falling back to a plain allocation of the
    /// heap's buffer size when the heap is exhausted
    pub fn from_heap(heap: &Arc<BufferHeap>) -> Self {
        Self::try_from_heap(heap).unwrap_or_else(|| Self::with_capacity(heap.buffer_size()))
    }

    /// Draw a buffer from `heap`, or `None` when it is exhausted
    pub fn try_from_heap(heap: &Arc<BufferHeap>) -> Option<Self> {
        let buffer = heap.pop()?;
        let span = buffer.len();
        // SAFETY: HeapBuffer pointers are never null.
        let ptr = unsafe { NonNull::new_unchecked(buffer.as_ptr()) };
        let index = buffer.into_index();
        Some(Self {
            ptr,
            span,
            begin: 0,
            len: span,
            release: Release::Heap {
                heap: Arc::clone(heap),
                index,
            },
        })
    }

    /// Wrap a caller-supplied buffer; `on_release` gets it back exactly once
    pub fn with_release<F>(buffer: Box<[u8]>, on_release: F) -> Self
    where
        F: FnOnce(Box<[u8]>) + Send + 'static,
    {
        Self::from_box(buffer, Some(Box::new(on_release)))
    }

    /// Borrow `len` bytes at `ptr` without taking ownership
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes, and must not
    /// be accessed through any other path, for the life of the packet.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr: NonNull::new(ptr).unwrap_or(NonNull::dangling()),
            span: if ptr.is_null() { 0 } else { len },
            begin: 0,
            len: if ptr.is_null() { 0 } else { len },
            release: Release::Borrowed,
        }
    }

    fn from_box(buffer: Box<[u8]>, callback: Option<ReleaseCallback>) -> Self {
        let span = buffer.len();
        let raw = Box::into_raw(buffer) as *mut u8;
        Self {
            // SAFETY: Box::into_raw never returns null.
            ptr: unsafe { NonNull::new_unchecked(raw) },
            span,
            begin: 0,
            len: span,
            release: match callback {
                Some(f) => Release::Callback(f),
                None => Release::Owned,
            },
        }
    }

    /// Bytes in the logical window
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Largest size [`resize`](Packet::resize) will accept
    #[inline]
    pub fn capacity(&self) -> usize {
        self.span - self.begin
    }

    /// Set the window length without reallocating
    pub fn resize(&mut self, size: usize) -> Result<(), PacketError> {
        if size > self.capacity() {
            return Err(PacketError::ExceedsCapacity {
                requested: size,
                capacity: self.capacity(),
            });
        }
        self.len = size;
        Ok(())
    }

    /// Drop up to `n` bytes from the front of the window. Returns the
    /// number actually discarded.
    pub fn discard(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        self.begin += n;
        self.len -= n;
        n
    }

    /// The whole writable tail `[begin, span)`, ignoring the current length
    #[inline]
    pub fn writable_mut(&mut self) -> &mut [u8] {
        // SAFETY: begin <= span and the packet has exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(self.begin), self.span - self.begin) }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(self.begin), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(self.begin), self.len) }
    }

    /// True if this packet holds a buffer issued by `heap`
    pub fn is_from(&self, heap: &BufferHeap) -> bool {
        matches!(&self.release, Release::Heap { heap: h, .. } if ptr::eq(Arc::as_ptr(h), heap))
    }

    #[inline]
    pub fn is_borrowed(&self) -> bool {
        matches!(self.release, Release::Borrowed)
    }

    fn release_kind(&self) -> &'static str {
        match self.release {
            Release::Borrowed => "borrowed",
            Release::Heap { .. } => "heap",
            Release::Owned => "owned",
            Release::Callback(_) => "callback",
        }
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.release, Release::Borrowed) {
            Release::Borrowed => {}
            Release::Heap { heap, index } => heap.release_index(index),
            Release::Owned => unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.span)));
            },
            Release::Callback(f) => {
                let buffer = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.span)) };
                f(buffer);
            }
        }
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl Deref for Packet {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for Packet {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<&[u8]> for Packet {
    fn from(bytes: &[u8]) -> Self {
        Self::from_box(bytes.to_vec().into_boxed_slice(), None)
    }
}

impl From<&str> for Packet {
    fn from(s: &str) -> Self {
        Self::from(s.as_bytes())
    }
}

impl From<Vec<u8>> for Packet {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_box(bytes.into_boxed_slice(), None)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("begin", &self.begin)
            .field("span", &self.span)
            .field("release", &self.release_kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_heap::BufferHeapConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn heap(capacity: usize) -> Arc<BufferHeap> {
        Arc::new(BufferHeap::new(BufferHeapConfig::default().capacity(capacity).buffer_size(256)).unwrap())
    }

    #[test]
    fn test_heap_packet_released_once_after_move() {
        let heap = heap(4);
        let before = heap.available();

        let packet = Packet::from_heap(&heap);
        assert!(packet.is_from(&heap));
        assert_eq!(heap.available(), before - 1);

        let moved = packet;
        let holder = vec![moved];
        let moved_again = holder.into_iter().next().unwrap();
        assert_eq!(heap.available(), before - 1);

        drop(moved_again);
        assert_eq!(heap.available(), before);
        assert_eq!(heap.outstanding(), 0);
    }

    #[test]
    fn test_heap_exhaustion_falls_back() {
        let heap = heap(1);
        let first = Packet::from_heap(&heap);
        let second = Packet::from_heap(&heap);
        assert!(first.is_from(&heap));
        assert!(!second.is_from(&heap));
        assert_eq!(second.len(), heap.buffer_size());
        assert!(Packet::try_from_heap(&heap).is_none());

        drop(second);
        assert_eq!(heap.available(), 0);
        drop(first);
        assert_eq!(heap.available(), 1);
    }

    #[test]
    fn test_resize_within_capacity() {
        let mut p = Packet::with_capacity(16);
        assert!(p.resize(4).is_ok());
        assert_eq!(p.len(), 4);
        assert!(p.resize(16).is_ok());
        assert_eq!(
            p.resize(17),
            Err(PacketError::ExceedsCapacity { requested: 17, capacity: 16 })
        );
        assert_eq!(p.len(), 16);
    }

    #[test]
    fn test_discard_moves_window() {
        let mut p = Packet::from("hello world");
        assert_eq!(p.discard(6), 6);
        assert_eq!(&p[..], b"world");
        assert_eq!(p.capacity(), 5);
        assert_eq!(p.discard(100), 5);
        assert!(p.is_empty());
        assert_eq!(p.discard(1), 0);
    }

    #[test]
    fn test_release_callback_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let mut p = Packet::with_release(vec![7u8; 32].into_boxed_slice(), move |buf| {
            assert_eq!(buf.len(), 32);
            assert_eq!(buf[31], 9);
            c.fetch_add(1, Ordering::SeqCst);
        });
        p[31] = 9;
        let moved = p;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        drop(moved);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_borrowed_does_not_free() {
        let mut backing = [1u8, 2, 3, 4];
        {
            let mut p = unsafe { Packet::from_raw_parts(backing.as_mut_ptr(), backing.len()) };
            assert!(p.is_borrowed());
            p[0] = 10;
            p.discard(1);
            assert_eq!(&p[..], &[2, 3, 4]);
        }
        assert_eq!(backing, [10, 2, 3, 4]);
    }

    #[test]
    fn test_copying_constructors() {
        let p = Packet::from(&b"abc"[..]);
        assert_eq!(p.as_ref(), b"abc");
        let p = Packet::from(vec![1u8, 2]);
        assert_eq!(&*p, &[1, 2]);
        assert!(Packet::default().is_empty());
    }

    #[test]
    fn test_writable_mut_spans_tail() {
        let mut p = Packet::with_capacity(8);
        p.resize(0).unwrap();
        p.writable_mut()[..3].copy_from_slice(b"xyz");
        p.resize(3).unwrap();
        assert_eq!(&p[..], b"xyz");
    }

    #[test]
    fn test_packet_crosses_threads() {
        let heap = heap(2);
        let mut p = Packet::from_heap(&heap);
        p.resize(3).unwrap();
        p.copy_from_slice(b"abc");
        let h = std::thread::spawn(move || p.to_vec());
        assert_eq!(h.join().unwrap(), b"abc");
        assert_eq!(heap.available(), 2);
    }
}
