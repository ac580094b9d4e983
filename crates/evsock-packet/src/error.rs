use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferHeapError {
    /// `mmap` failed; carries `errno`
    #[error("failed to map buffer heap: os error {0}")]
    Map(i32),

    /// capacity × buffer size does not fit in the address space
    #[error("buffer heap too large: {capacity} buffers of {buffer_size} bytes")]
    TooLarge { capacity: usize, buffer_size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("requested size {requested} exceeds capacity {capacity}")]
    ExceedsCapacity { requested: usize, capacity: usize },
}
