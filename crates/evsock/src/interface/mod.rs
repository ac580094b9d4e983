//! Network interfaces: OS enumeration and the virtual interface that
//! owns a poller, its contract groups and every socket created through it

pub mod enumerate;
pub mod virtual_interface;

pub use enumerate::{find_network_interface, network_interfaces, NetworkInterfaceInfo};
pub use virtual_interface::{InterfaceConfig, VirtualNetworkInterface, DEFAULT_CONTRACT_CAPACITY};
