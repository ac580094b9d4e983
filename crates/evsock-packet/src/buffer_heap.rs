//! Fixed-size buffers carved out of one anonymous mapping
//!
//! Free buffers are tracked by index in a bounded lock-free MPMC queue
//! sized to the buffer count, so `pop`/`push` never block and never touch
//! the process allocator. Every buffer is either in the free queue or
//! checked out as a [`HeapBuffer`], which hands its slot back when dropped.

use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use evsock_core::env::env_get;
use tracing::debug;

use crate::error::BufferHeapError;

pub const DEFAULT_CAPACITY: usize = 1 << 16;
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Buffer heap sizing
///
/// Both values are rounded up to a power of two when the heap is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeapConfig {
    /// Number of buffers
    pub capacity: usize,
    /// Bytes per buffer
    pub buffer_size: usize,
}

impl Default for BufferHeapConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl BufferHeapConfig {
    /// Read `EVSOCK_HEAP_CAPACITY` and `EVSOCK_HEAP_BUFFER_SIZE`
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            capacity: env_get("EVSOCK_HEAP_CAPACITY", d.capacity),
            buffer_size: env_get("EVSOCK_HEAP_BUFFER_SIZE", d.buffer_size),
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// One checked-out buffer, returned to its heap on drop
pub struct HeapBuffer<'a> {
    heap: &'a BufferHeap,
    ptr: NonNull<u8>,
    index: u32,
    len: usize,
}

impl HeapBuffer<'_> {
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Detach from the handle; the slot stays checked out until
    /// `release_index` is called with the returned index.
    pub(crate) fn into_index(self) -> u32 {
        let index = self.index;
        mem::forget(self);
        index
    }
}

impl Drop for HeapBuffer<'_> {
    fn drop(&mut self) {
        self.heap.release_index(self.index);
    }
}

impl fmt::Debug for HeapBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBuffer")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

// SAFETY: a HeapBuffer is exclusive access to its slice of the mapping.
unsafe impl Send for HeapBuffer<'_> {}

pub struct BufferHeap {
    base: NonNull<u8>,
    mapped_len: usize,
    buffer_size: usize,
    capacity: usize,
    free: ArrayQueue<u32>,
    outstanding: AtomicUsize,
}

// SAFETY: the mapping is only reached through HeapBuffers, which are handed
// out exclusively by the lock-free free queue.
unsafe impl Send for BufferHeap {}
unsafe impl Sync for BufferHeap {}

impl BufferHeap {
    pub fn new(config: BufferHeapConfig) -> Result<Self, BufferHeapError> {
        let capacity = config.capacity.max(1).next_power_of_two();
        let buffer_size = config.buffer_size.max(1).next_power_of_two();
        let mapped_len = capacity
            .checked_mul(buffer_size)
            .filter(|&n| capacity <= u32::MAX as usize && n <= isize::MAX as usize)
            .ok_or(BufferHeapError::TooLarge { capacity, buffer_size })?;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(BufferHeapError::Map(last_errno()));
        }
        let base = NonNull::new(base as *mut u8).ok_or(BufferHeapError::Map(libc::ENOMEM))?;

        let free = ArrayQueue::new(capacity);
        for index in 0..capacity as u32 {
            let _ = free.push(index);
        }

        debug!(capacity, buffer_size, mapped_len, "buffer heap mapped");
        Ok(Self {
            base,
            mapped_len,
            buffer_size,
            capacity,
            free,
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Claim a free buffer, or `None` if the heap is exhausted
    pub fn pop(&self) -> Option<HeapBuffer<'_>> {
        let index = self.free.pop()?;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        // SAFETY: index < capacity, so the offset stays inside the non-null mapping.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index as usize * self.buffer_size)) };
        Some(HeapBuffer {
            heap: self,
            ptr,
            index,
            len: self.buffer_size,
        })
    }

    /// Return a buffer to the free queue
    ///
    /// A buffer issued by a different heap is handed back untouched.
    pub fn push<'b>(&self, buffer: HeapBuffer<'b>) -> Result<(), HeapBuffer<'b>> {
        if !ptr::eq(buffer.heap, self) {
            return Err(buffer);
        }
        drop(buffer);
        Ok(())
    }

    pub(crate) fn release_index(&self, index: u32) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let pushed = self.free.push(index).is_ok();
        debug_assert!(pushed, "buffer heap free queue overflow at index {index}");
    }

    /// True if `ptr` points into this heap's mapping
    #[inline]
    pub fn owns(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as usize;
        let p = ptr as usize;
        p >= start && p < start + self.mapped_len
    }

    /// Buffers currently in the free queue
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Buffers currently checked out
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Drop for BufferHeap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped_len);
        }
    }
}

impl fmt::Debug for BufferHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHeap")
            .field("capacity", &self.capacity)
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.available())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[inline]
fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn small_heap(capacity: usize, buffer_size: usize) -> BufferHeap {
        BufferHeap::new(BufferHeapConfig::default().capacity(capacity).buffer_size(buffer_size)).unwrap()
    }

    #[test]
    fn test_rounds_up_to_power_of_two() {
        let heap = small_heap(100, 1000);
        assert_eq!(heap.capacity(), 128);
        assert_eq!(heap.buffer_size(), 1024);
        assert_eq!(heap.available(), 128);
    }

    #[test]
    fn test_pop_until_exhausted() {
        let heap = small_heap(4, 64);
        let bufs: Vec<_> = (0..4).map(|_| heap.pop().unwrap()).collect();
        assert!(heap.pop().is_none());
        assert_eq!(heap.outstanding(), 4);

        let distinct: HashSet<_> = bufs.iter().map(|b| b.as_ptr() as usize).collect();
        assert_eq!(distinct.len(), 4);
        for b in &bufs {
            assert!(heap.owns(b.as_ptr()));
            assert_eq!(b.len(), 64);
        }

        for b in bufs {
            heap.push(b).unwrap();
        }
        assert_eq!(heap.available(), 4);
        assert_eq!(heap.outstanding(), 0);
    }

    #[test]
    fn test_conservation_sequential() {
        let heap = small_heap(16, 32);
        let mut held = Vec::new();
        for step in 0..200usize {
            if step % 3 == 2 {
                if let Some(b) = held.pop() {
                    heap.push(b).unwrap();
                }
            } else if let Some(b) = heap.pop() {
                held.push(b);
            }
            assert_eq!(heap.outstanding() + heap.available(), heap.capacity());
            assert_eq!(heap.outstanding(), held.len());
        }
    }

    #[test]
    fn test_conservation_concurrent() {
        let heap = small_heap(64, 64);
        let remaining: Vec<HeapBuffer<'_>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let heap = &heap;
                    scope.spawn(move || {
                        let mut held = Vec::new();
                        for i in 0..10_000usize {
                            if (i + t) % 2 == 0 {
                                if let Some(b) = heap.pop() {
                                    // SAFETY: exclusive access to this buffer.
                                    unsafe { *b.as_ptr() = t as u8 };
                                    held.push(b);
                                }
                            } else if let Some(b) = held.pop() {
                                assert_eq!(unsafe { *b.as_ptr() }, t as u8);
                                heap.push(b).unwrap();
                            }
                        }
                        held
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(heap.outstanding(), remaining.len());
        assert_eq!(heap.outstanding() + heap.available(), heap.capacity());

        drop(remaining);
        assert_eq!(heap.available(), heap.capacity());
    }

    #[test]
    fn test_dropped_buffer_returns_to_heap() {
        let heap = small_heap(2, 64);
        let first = heap.pop().unwrap();
        let second = heap.pop().unwrap();
        assert!(heap.pop().is_none());
        drop(first);
        assert_eq!(heap.available(), 1);
        assert_eq!(heap.outstanding(), 1);
        let again = heap.pop().unwrap();
        drop((again, second));
        assert_eq!(heap.available(), 2);
        assert_eq!(heap.outstanding(), 0);
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let a = small_heap(2, 64);
        let b = small_heap(2, 64);
        let buf = a.pop().unwrap();
        assert!(!b.owns(buf.as_ptr()));
        let buf = b.push(buf).unwrap_err();
        assert_eq!(b.available(), 2);
        a.push(buf).unwrap();
        assert_eq!(a.available(), 2);
    }
}
