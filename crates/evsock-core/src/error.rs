//! Error types shared by the reactor crates

use thiserror::Error;

/// Failures creating or scheduling a work contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContractError {
    /// Every slot in the group is in use
    #[error("contract group is full")]
    GroupFull,

    /// The group has been stopped and accepts no new contracts
    #[error("contract group is stopped")]
    Stopped,
}

/// Outcome of a connect or multicast join that did not succeed
///
/// An in-progress non-blocking connect is reported as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("invalid destination address")]
    InvalidDestination,

    #[error("socket has no valid file descriptor")]
    InvalidFileDescriptor,

    #[error("socket is already connected")]
    AlreadyConnected,

    /// Not available on this transport, e.g. joining a group over TCP
    #[error("operation not supported by this transport")]
    Unsupported,

    /// The OS rejected the request; carries `errno`
    #[error("connect failed: os error {0}")]
    Os(i32),
}

impl ConnectError {
    /// Raw OS error code, if this came from the kernel
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ConnectError::Os(code) => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ContractError::GroupFull.to_string(), "contract group is full");
        assert_eq!(ConnectError::Os(111).to_string(), "connect failed: os error 111");
        assert_eq!(ConnectError::AlreadyConnected.to_string(), "socket is already connected");
    }

    #[test]
    fn test_raw_os_error() {
        assert_eq!(ConnectError::Os(13).raw_os_error(), Some(13));
        assert_eq!(ConnectError::InvalidDestination.raw_os_error(), None);
    }
}
