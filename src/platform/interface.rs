// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Interface records and the master/slave registry.
//!
//! Interfaces are opened once at startup from the command line names and are
//! immutable afterwards. MTU is re-read on demand because it may change while
//! the daemon runs.

use anyhow::{anyhow, Context, Result};
use nix::net::if_::if_nametoindex;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Role of an interface as seen by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceRole {
    /// Uplink facing the ISP
    Master,
    /// Downstream link facing local hosts
    Slave,
}

/// A network interface the daemon operates on.
#[derive(Debug, Clone)]
pub struct Interface {
    /// Kernel interface index
    pub index: u32,
    /// Interface name (e.g. "eth0")
    pub name: String,
    /// MTU at startup
    pub mtu: u32,
    /// Link-layer address
    pub mac: [u8; 6],
    pub role: InterfaceRole,
    /// Only DAD and router-directed traffic are proxied on external slaves
    pub external: bool,
}

impl Interface {
    pub fn is_master(&self) -> bool {
        self.role == InterfaceRole::Master
    }
}

/// One master plus N slaves, fixed for the lifetime of the process.
#[derive(Debug)]
pub struct InterfaceRegistry {
    pub master: Interface,
    pub slaves: Vec<Interface>,
}

impl InterfaceRegistry {
    /// Open all interfaces named on the command line. Any failure is fatal.
    pub fn open(master: &str, slaves: &[(String, bool)]) -> Result<Self> {
        let master = open_interface(master, InterfaceRole::Master, false)?;
        let slaves = slaves
            .iter()
            .map(|(name, external)| open_interface(name, InterfaceRole::Slave, *external))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { master, slaves })
    }

    pub fn by_index(&self, index: u32) -> Option<&Interface> {
        if self.master.index == index {
            return Some(&self.master);
        }
        self.slaves.iter().find(|s| s.index == index)
    }

    pub fn is_master(&self, index: u32) -> bool {
        self.master.index == index
    }

    /// Position of a slave in the slave table, by interface index.
    pub fn slave_position(&self, index: u32) -> Option<usize> {
        self.slaves.iter().position(|s| s.index == index)
    }

    /// Master plus all slaves.
    pub fn all(&self) -> impl Iterator<Item = &Interface> {
        std::iter::once(&self.master).chain(self.slaves.iter())
    }
}

/// Create an interface context from its name.
fn open_interface(name: &str, role: InterfaceRole, external: bool) -> Result<Interface> {
    let index = if_nametoindex(name)
        .map_err(|e| anyhow!("Unable to open interface {} ({})", name, e))?;

    let sock = ioctl_socket()?;
    let mtu = query_mtu(&sock, name)?;
    let mac = query_hwaddr(&sock, name)?;

    Ok(Interface {
        index,
        name: name.to_string(),
        mtu,
        mac,
        role,
        external,
    })
}

/// Re-read the current MTU of an interface.
pub fn interface_mtu(name: &str) -> Result<u32> {
    let sock = ioctl_socket()?;
    query_mtu(&sock, name)
}

fn ioctl_socket() -> Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the return value is checked before use.
    let fd = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to create ioctl socket");
    }
    // SAFETY: fd was just created and verified valid; OwnedFd closes it on drop.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ifreq_for(name: &str) -> Result<libc::ifreq> {
    // SAFETY: ifreq is plain old data; a zeroed value is a valid request.
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let bytes = name.as_bytes();
    if bytes.len() >= ifr.ifr_name.len() {
        return Err(anyhow!("Interface name too long: {}", name));
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

fn query_mtu(sock: &OwnedFd, name: &str) -> Result<u32> {
    let mut ifr = ifreq_for(name)?;
    // SAFETY: SIOCGIFMTU reads ifr_name and writes ifru_mtu within the same struct.
    let res = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFMTU as _, &mut ifr) };
    if res < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("SIOCGIFMTU failed for {}", name));
    }
    // SAFETY: the kernel filled ifru_mtu on success.
    Ok(unsafe { ifr.ifr_ifru.ifru_mtu } as u32)
}

fn query_hwaddr(sock: &OwnedFd, name: &str) -> Result<[u8; 6]> {
    let mut ifr = ifreq_for(name)?;
    // SAFETY: SIOCGIFHWADDR reads ifr_name and writes ifru_hwaddr within the same struct.
    let res = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFHWADDR as _, &mut ifr) };
    if res < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("SIOCGIFHWADDR failed for {}", name));
    }
    let mut mac = [0u8; 6];
    // SAFETY: the kernel filled ifru_hwaddr on success; sa_data holds the MAC.
    let sa_data = unsafe { ifr.ifr_ifru.ifru_hwaddr.sa_data };
    for (dst, src) in mac.iter_mut().zip(sa_data.iter()) {
        *dst = *src as u8;
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_loopback() {
        // Loopback always exists
        let iface = open_interface("lo", InterfaceRole::Master, false).unwrap();
        assert!(iface.index > 0);
        assert_eq!(iface.name, "lo");
        assert!(iface.mtu > 0);
        assert!(iface.is_master());
    }

    #[test]
    fn test_open_nonexistent_fails() {
        let result = open_interface("nonexistent_iface_xyz123", InterfaceRole::Slave, false);
        assert!(result.is_err());
    }

    #[test]
    fn test_interface_mtu_loopback() {
        let mtu = interface_mtu("lo").unwrap();
        assert!(mtu >= 1280, "IPv6 requires MTU >= 1280, got {}", mtu);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = InterfaceRegistry {
            master: Interface {
                index: 2,
                name: "wan0".into(),
                mtu: 1500,
                mac: [0; 6],
                role: InterfaceRole::Master,
                external: false,
            },
            slaves: vec![
                Interface {
                    index: 3,
                    name: "lan0".into(),
                    mtu: 1500,
                    mac: [0; 6],
                    role: InterfaceRole::Slave,
                    external: false,
                },
                Interface {
                    index: 7,
                    name: "guest0".into(),
                    mtu: 1500,
                    mac: [0; 6],
                    role: InterfaceRole::Slave,
                    external: true,
                },
            ],
        };

        assert!(registry.is_master(2));
        assert!(!registry.is_master(3));
        assert_eq!(registry.by_index(3).unwrap().name, "lan0");
        assert_eq!(registry.by_index(7).unwrap().name, "guest0");
        assert!(registry.by_index(9).is_none());
        assert_eq!(registry.slave_position(7), Some(1));
        assert_eq!(registry.slave_position(2), None);
        assert_eq!(registry.all().count(), 3);
    }
}
