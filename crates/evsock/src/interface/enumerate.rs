//! IPv4 network interface enumeration via `getifaddrs`

use std::net::{Ipv4Addr, SocketAddrV4};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

use crate::error::InterfaceError;

/// One IPv4 address of a physical interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterfaceInfo {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Option<Ipv4Addr>,
    pub up: bool,
    pub loopback: bool,
    pub broadcast: bool,
    pub multicast: bool,
    pub running: bool,
}

/// Every interface with an IPv4 address, in kernel order
pub fn network_interfaces() -> Result<Vec<NetworkInterfaceInfo>, InterfaceError> {
    let addrs = getifaddrs().map_err(|e| InterfaceError::Enumerate(e as i32))?;
    let interfaces = addrs
        .filter_map(|ifa| {
            let ip = ifa.address.as_ref()?.as_sockaddr_in().map(|sin| *SocketAddrV4::from(*sin).ip())?;
            let netmask = ifa
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in())
                .map(|sin| *SocketAddrV4::from(*sin).ip());
            let flags = ifa.flags;
            Some(NetworkInterfaceInfo {
                name: ifa.interface_name,
                ip,
                netmask,
                up: flags.contains(InterfaceFlags::IFF_UP),
                loopback: flags.contains(InterfaceFlags::IFF_LOOPBACK),
                broadcast: flags.contains(InterfaceFlags::IFF_BROADCAST),
                multicast: flags.contains(InterfaceFlags::IFF_MULTICAST),
                running: flags.contains(InterfaceFlags::IFF_RUNNING),
            })
        })
        .collect();
    Ok(interfaces)
}

/// First IPv4 address of the named interface
pub fn find_network_interface(name: &str) -> Result<Option<NetworkInterfaceInfo>, InterfaceError> {
    Ok(network_interfaces()?.into_iter().find(|i| i.name == name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_reports_ipv4_only() {
        let interfaces = network_interfaces().unwrap();
        for i in &interfaces {
            assert!(!i.name.is_empty());
        }
        // Loopback, when present, carries 127.0.0.0/8.
        if let Some(lo) = interfaces.iter().find(|i| i.loopback) {
            assert!(lo.ip.is_loopback());
        }
    }

    #[test]
    fn test_find_unknown_interface() {
        assert_eq!(find_network_interface("__evsock_no_such_if").unwrap(), None);
    }

    #[test]
    fn test_find_round_trip() {
        let interfaces = network_interfaces().unwrap();
        if let Some(first) = interfaces.first() {
            let found = find_network_interface(&first.name).unwrap().unwrap();
            assert_eq!(found.name, first.name);
        }
    }
}
