//! Thin wrappers over the raw socket syscalls
//!
//! Every call returns the `errno` on failure, captured immediately after
//! the failing syscall.

use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::socket::Transport;

#[inline]
pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
pub(crate) fn is_would_block(code: i32) -> bool {
    code == libc::EAGAIN || code == libc::EWOULDBLOCK
}

/// Send errors that leave the request worth retrying
#[inline]
pub(crate) fn is_transient_send_error(code: i32) -> bool {
    is_would_block(code) || code == libc::EINTR || code == libc::ENOBUFS
}

pub(crate) fn to_sockaddr(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    raw.sin_family = libc::AF_INET as libc::sa_family_t;
    raw.sin_port = addr.port().to_be();
    raw.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    raw
}

pub(crate) fn from_sockaddr(raw: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr)), u16::from_be(raw.sin_port))
}

#[inline]
pub(crate) fn in_addr(ip: Ipv4Addr) -> libc::in_addr {
    libc::in_addr { s_addr: u32::from(ip).to_be() }
}

const SOCKADDR_IN_LEN: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

/// Create an IPv4 socket for `transport` with close-on-exec set
pub(crate) fn open(transport: Transport) -> Result<OwnedFd, i32> {
    let (kind, protocol) = match transport {
        Transport::Tcp => (libc::SOCK_STREAM, libc::IPPROTO_TCP),
        Transport::Udp => (libc::SOCK_DGRAM, libc::IPPROTO_UDP),
    };
    let fd = unsafe { libc::socket(libc::AF_INET, kind | libc::SOCK_CLOEXEC, protocol) };
    if fd < 0 {
        return Err(errno());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn set_option<T: Copy>(fd: RawFd, level: i32, name: i32, value: T) -> Result<(), i32> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(errno());
    }
    Ok(())
}

pub(crate) fn get_option<T: Copy + Default>(fd: RawFd, level: i32, name: i32) -> Result<T, i32> {
    let mut value = T::default();
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(fd, level, name, &mut value as *mut T as *mut libc::c_void, &mut len)
    };
    if ret != 0 {
        return Err(errno());
    }
    Ok(value)
}

pub(crate) fn bind(fd: RawFd, addr: SocketAddrV4) -> Result<(), i32> {
    let raw = to_sockaddr(addr);
    let ret = unsafe { libc::bind(fd, &raw as *const _ as *const libc::sockaddr, SOCKADDR_IN_LEN) };
    if ret != 0 {
        return Err(errno());
    }
    Ok(())
}

pub(crate) fn local_address(fd: RawFd) -> Result<SocketAddrV4, i32> {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = SOCKADDR_IN_LEN;
    let ret = unsafe { libc::getsockname(fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret != 0 {
        return Err(errno());
    }
    Ok(from_sockaddr(&raw))
}

pub(crate) fn peer_address(fd: RawFd) -> Result<SocketAddrV4, i32> {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = SOCKADDR_IN_LEN;
    let ret = unsafe { libc::getpeername(fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret != 0 {
        return Err(errno());
    }
    Ok(from_sockaddr(&raw))
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), i32> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(errno());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } != 0 {
        return Err(errno());
    }
    Ok(())
}

pub(crate) fn shutdown(fd: RawFd, how: i32) -> Result<(), i32> {
    if unsafe { libc::shutdown(fd, how) } != 0 {
        return Err(errno());
    }
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: i32) -> Result<(), i32> {
    if unsafe { libc::listen(fd, backlog) } != 0 {
        return Err(errno());
    }
    Ok(())
}

/// Accept one pending connection. `Ok(None)` when the backlog is empty.
pub(crate) fn accept(fd: RawFd) -> Result<Option<OwnedFd>, i32> {
    loop {
        let ret = unsafe {
            libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK)
        };
        if ret >= 0 {
            return Ok(Some(unsafe { OwnedFd::from_raw_fd(ret) }));
        }
        match errno() {
            libc::EINTR => continue,
            code if is_would_block(code) => return Ok(None),
            code => return Err(code),
        }
    }
}

/// Non-blocking connect; `EINPROGRESS` counts as success
pub(crate) fn connect(fd: RawFd, addr: SocketAddrV4) -> Result<(), i32> {
    let raw = to_sockaddr(addr);
    let ret = unsafe { libc::connect(fd, &raw as *const _ as *const libc::sockaddr, SOCKADDR_IN_LEN) };
    if ret != 0 {
        let code = errno();
        if code != libc::EINPROGRESS {
            return Err(code);
        }
    }
    Ok(())
}

pub(crate) fn send(fd: RawFd, data: &[u8]) -> Result<usize, i32> {
    let ret = unsafe { libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), libc::MSG_NOSIGNAL) };
    if ret < 0 {
        return Err(errno());
    }
    Ok(ret as usize)
}

/// `sendto` the given destination, or the connected peer when `None`
pub(crate) fn send_to(fd: RawFd, data: &[u8], destination: Option<SocketAddrV4>) -> Result<usize, i32> {
    let raw = destination.map(to_sockaddr);
    let (addr, len) = match raw.as_ref() {
        Some(raw) => (raw as *const _ as *const libc::sockaddr, SOCKADDR_IN_LEN),
        None => (std::ptr::null(), 0),
    };
    let ret = unsafe {
        libc::sendto(fd, data.as_ptr() as *const libc::c_void, data.len(), libc::MSG_NOSIGNAL, addr, len)
    };
    if ret < 0 {
        return Err(errno());
    }
    Ok(ret as usize)
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> Result<usize, i32> {
    let ret = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if ret < 0 {
        return Err(errno());
    }
    Ok(ret as usize)
}

pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), i32> {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = SOCKADDR_IN_LEN;
    let ret = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut raw as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(errno());
    }
    Ok((ret as usize, from_sockaddr(&raw)))
}

/// Pending error on the socket (`SO_ERROR`), clearing it
pub(crate) fn take_error(fd: RawFd) -> i32 {
    get_option::<libc::c_int>(fd, libc::SOL_SOCKET, libc::SO_ERROR).unwrap_or_else(|code| code)
}

pub(crate) fn membership(group: Ipv4Addr, interface: Ipv4Addr) -> libc::ip_mreq {
    libc::ip_mreq {
        imr_multiaddr: in_addr(group),
        imr_interface: in_addr(interface),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_sockaddr_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 4242);
        let raw = to_sockaddr(addr);
        assert_eq!(raw.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(raw.sin_port, 4242u16.to_be());
        assert_eq!(from_sockaddr(&raw), addr);
    }

    #[test]
    fn test_bind_and_local_address() {
        let fd = open(Transport::Udp).unwrap();
        bind(fd.as_raw_fd(), SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let local = local_address(fd.as_raw_fd()).unwrap();
        assert_eq!(*local.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(local.port(), 0);
        assert_eq!(peer_address(fd.as_raw_fd()), Err(libc::ENOTCONN));
    }

    #[test]
    fn test_options() {
        let fd = open(Transport::Tcp).unwrap();
        set_option::<libc::c_int>(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, 1).unwrap();
        let v: libc::c_int = get_option(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR).unwrap();
        assert_ne!(v, 0);
        assert_eq!(take_error(fd.as_raw_fd()), 0);
    }

    #[test]
    fn test_accept_empty_backlog_would_block() {
        let fd = open(Transport::Tcp).unwrap();
        bind(fd.as_raw_fd(), SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        listen(fd.as_raw_fd(), 8).unwrap();
        set_nonblocking(fd.as_raw_fd()).unwrap();
        assert!(accept(fd.as_raw_fd()).unwrap().is_none());
    }
}
