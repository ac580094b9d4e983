//! IPv4 address helpers and socket I/O mode
//!
//! Addresses are plain `std::net` values. The helpers here encode the
//! reactor's notion of validity: `255.255.255.255` is the "none" sentinel,
//! `0.0.0.0` is "any" and port 0 is "any port".

use std::net::{Ipv4Addr, SocketAddrV4};

/// The "none" sentinel. Never a valid destination or bind address.
pub const IP_NONE: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Bind to every local address.
pub const IP_ANY: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Ask the OS for an ephemeral port.
pub const PORT_ANY: u16 = 0;

/// True unless `ip` is the "none" sentinel
#[inline]
pub fn is_valid_ip(ip: Ipv4Addr) -> bool {
    ip != IP_NONE
}

/// True if `addr` can be used as a connect/join destination
#[inline]
pub fn is_valid_address(addr: SocketAddrV4) -> bool {
    is_valid_ip(*addr.ip())
}

/// Which directions of a socket remain open
///
/// Applied with a partial `shutdown(2)`: `Read` shuts down writes,
/// `Write` shuts down reads, `None` shuts down both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    None,
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl IoMode {
    #[inline]
    pub const fn can_read(self) -> bool {
        matches!(self, IoMode::Read | IoMode::ReadWrite)
    }

    #[inline]
    pub const fn can_write(self) -> bool {
        matches!(self, IoMode::Write | IoMode::ReadWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity() {
        assert!(!is_valid_ip(IP_NONE));
        assert!(is_valid_ip(IP_ANY));
        assert!(is_valid_ip(Ipv4Addr::LOCALHOST));
        assert!(!is_valid_address(SocketAddrV4::new(IP_NONE, 80)));
        assert!(is_valid_address(SocketAddrV4::new(Ipv4Addr::new(239, 0, 0, 1), 3000)));
    }

    #[test]
    fn test_io_mode() {
        assert_eq!(IoMode::default(), IoMode::ReadWrite);
        assert!(IoMode::Read.can_read() && !IoMode::Read.can_write());
        assert!(IoMode::Write.can_write() && !IoMode::Write.can_read());
        assert!(!IoMode::None.can_read() && !IoMode::None.can_write());
    }
}
