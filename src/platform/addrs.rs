// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Quick interface address lookups via getifaddrs.
//!
//! Used where a single usable source address is needed (DHCPv6 link-address,
//! DNS rewriting). Prefix lifetimes come from netlink instead, see
//! [`crate::platform::netlink`].

use std::net::Ipv6Addr;

fn is_unicast_link_local(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

/// Detect an IPv6 address currently assigned to the given interface.
///
/// Returns the first address found, optionally skipping link-locals.
pub fn interface_address(ifname: &str, allow_linklocal: bool) -> Option<Ipv6Addr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        if ifaddr.interface_name != ifname {
            continue;
        }
        let Some(storage) = ifaddr.address else {
            continue;
        };
        let Some(sin6) = storage.as_sockaddr_in6() else {
            continue;
        };
        let ip = sin6.ip();
        if !allow_linklocal && is_unicast_link_local(&ip) {
            continue;
        }
        return Some(ip);
    }
    None
}

/// A global address when one exists, any address otherwise.
pub fn interface_address_preferring_global(ifname: &str) -> Option<Ipv6Addr> {
    interface_address(ifname, false).or_else(|| interface_address(ifname, true))
}
