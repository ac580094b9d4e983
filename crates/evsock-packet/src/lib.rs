//! # evsock-packet
//!
//! Memory for the reactor's receive and send paths.
//!
//! - `buffer_heap` - fixed-size buffer pool over one `mmap`, lock-free free list
//! - `packet` - self-releasing byte window over owned, pooled or borrowed memory

pub mod buffer_heap;
pub mod error;
pub mod packet;

pub use buffer_heap::{BufferHeap, BufferHeapConfig, HeapBuffer};
pub use error::{BufferHeapError, PacketError};
pub use packet::Packet;
