// SPDX-License-Identifier: Apache-2.0 OR MIT
//! The forwarder primitive: scatter/gather send pinned to an egress interface.

use crate::logging::{Facility, Logger};
use crate::platform::interface::Interface;
use anyhow::Result;
use std::io::IoSlice;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::RawFd;

/// Destinations whose scope id must be forced to the egress interface.
pub fn needs_scope_override(addr: &Ipv6Addr) -> bool {
    let octets = addr.octets();
    let link_local_unicast = addr.segments()[0] & 0xffc0 == 0xfe80;
    let link_local_multicast = octets[0] == 0xff && octets[1] & 0x0f == 0x02;
    link_local_unicast || link_local_multicast
}

/// Send a datagram out a specific interface.
///
/// An `IPV6_PKTINFO` control message pins the egress interface. Raw-socket
/// destinations (port 0) get no control message because the kernel ignores
/// PKTINFO on IPv6 raw sockets; the scope id carries the interface instead.
///
/// Send failures are logged and reported, never fatal.
pub fn send_on(
    logger: &Logger,
    fd: RawFd,
    dest: &SocketAddrV6,
    iovs: &[IoSlice<'_>],
    iface: &Interface,
) -> Result<usize> {
    // SAFETY: sockaddr_in6 is plain old data.
    let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sin6.sin6_port = dest.port().to_be();
    sin6.sin6_flowinfo = dest.flowinfo();
    sin6.sin6_addr = libc::in6_addr {
        s6_addr: dest.ip().octets(),
    };
    sin6.sin6_scope_id = if needs_scope_override(dest.ip()) {
        iface.index
    } else {
        dest.scope_id()
    };

    // 8-byte aligned ancillary space, large enough for one in6_pktinfo cmsg.
    let mut cmsg_buf = [0u64; 8];

    // SAFETY: msghdr is plain old data.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut sin6 as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    // IoSlice is guaranteed ABI-compatible with iovec.
    msg.msg_iov = iovs.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iovs.len();

    if dest.port() != 0 {
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        // SAFETY: CMSG_SPACE/CMSG_LEN are pure size computations; the buffer
        // above is large enough and aligned for the single cmsg written here.
        unsafe {
            msg.msg_controllen =
                libc::CMSG_SPACE(std::mem::size_of::<libc::in6_pktinfo>() as libc::c_uint) as usize;
            let chdr = libc::CMSG_FIRSTHDR(&msg);
            (*chdr).cmsg_level = libc::IPPROTO_IPV6;
            (*chdr).cmsg_type = libc::IPV6_PKTINFO;
            (*chdr).cmsg_len =
                libc::CMSG_LEN(std::mem::size_of::<libc::in6_pktinfo>() as libc::c_uint) as usize;
            let pktinfo = libc::CMSG_DATA(chdr) as *mut libc::in6_pktinfo;
            (*pktinfo).ipi6_addr = libc::in6_addr { s6_addr: [0; 16] };
            (*pktinfo).ipi6_ifindex = iface.index as _;
        }
    }

    // SAFETY: msg points to valid name/iov/control buffers assembled above.
    let sent = unsafe { libc::sendmsg(fd, &msg, libc::MSG_DONTWAIT) };
    if sent < 0 {
        let err = std::io::Error::last_os_error();
        logger.warning(
            Facility::Network,
            &format!("Failed to relay to {}%{} ({})", dest.ip(), iface.name, err),
        );
        return Err(err.into());
    }

    logger.notice(
        Facility::Network,
        &format!("Relayed {} bytes to {}%{}", sent, dest.ip(), iface.name),
    );
    Ok(sent as usize)
}
