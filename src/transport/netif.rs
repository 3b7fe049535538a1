//! Enumeration of the local network interfaces that can take part in IPv4 multicast.

use std::net::Ipv4Addr;

use nix::net::if_::InterfaceFlags;
use tracing::trace;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MulticastInterface {
    /// OS interface name (e.g. "eth0")
    pub name: String,
    pub addr: Ipv4Addr,
}

/// Enumerate all interfaces that are up and running, support multicast and have an IPv4 address.
///
/// There is one entry per interface: if an interface has several IPv4 addresses, the first one
///  is used. Receive-only interfaces are not detectable through `getifaddrs` and are therefore
///  not filtered here; binding or sending on them fails when the socket is set up.
pub fn enumerate_multicast_interfaces() -> anyhow::Result<Vec<MulticastInterface>> {
    let mut result: Vec<MulticastInterface> = Vec::new();

    for ifaddr in nix::ifaddrs::getifaddrs()? {
        if !is_eligible(ifaddr.flags) {
            trace!("skipping interface {} with flags {:?}", ifaddr.interface_name, ifaddr.flags);
            continue;
        }
        let Some(addr) = ifaddr.address
            .as_ref()
            .and_then(|a| a.as_sockaddr_in())
            .map(|sin| Ipv4Addr::from(sin.ip()))
        else {
            continue;
        };

        if result.iter().any(|i| i.name == ifaddr.interface_name) {
            continue;
        }
        result.push(MulticastInterface {
            name: ifaddr.interface_name,
            addr,
        });
    }

    result.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(result)
}

/// Administratively up is not enough: an interface without carrier is not RUNNING
fn is_eligible(flags: InterfaceFlags) -> bool {
    flags.contains(InterfaceFlags::IFF_UP | InterfaceFlags::IFF_RUNNING | InterfaceFlags::IFF_MULTICAST)
}
