// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Minimal rtnetlink client: address dumps with lifetimes and host-route
//! installation.
//!
//! getifaddrs cannot report prefix lifetimes, which RA synthesis needs, so
//! addresses are dumped via `RTM_GETADDR` and the `IFA_CACHEINFO` attribute.
//! Requests are synchronous; both operations run at init or timer time, never
//! in a packet hot path.

use anyhow::{bail, Context, Result};
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// A learned address with its lifetimes, as used during RA synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrEntry {
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
    /// Remaining preferred lifetime in seconds
    pub preferred: u32,
    /// Remaining valid lifetime in seconds
    pub valid: u32,
}

const IFA_ADDRESS: u16 = 1;
const IFA_CACHEINFO: u16 = 6;

const RT_SCOPE_UNIVERSE: u8 = 0;
const RT_SCOPE_LINK: u8 = 253;
const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTN_UNICAST: u8 = 1;
const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;

const NLMSG_HDRLEN: usize = std::mem::size_of::<libc::nlmsghdr>();

#[repr(C)]
#[derive(Clone, Copy)]
struct IfAddrMsg {
    ifa_family: u8,
    ifa_prefixlen: u8,
    ifa_flags: u8,
    ifa_scope: u8,
    ifa_index: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RtMsg {
    rtm_family: u8,
    rtm_dst_len: u8,
    rtm_src_len: u8,
    rtm_tos: u8,
    rtm_table: u8,
    rtm_protocol: u8,
    rtm_scope: u8,
    rtm_type: u8,
    rtm_flags: u32,
}

fn nl_align(len: usize) -> usize {
    (len + 3) & !3
}

fn put_struct<T: Copy>(buf: &mut Vec<u8>, value: &T) {
    // SAFETY: T is a repr(C) plain-old-data struct; reading its bytes is valid.
    let bytes = unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    };
    buf.extend_from_slice(bytes);
}

fn netlink_socket() -> Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the return value is checked before use.
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            libc::NETLINK_ROUTE,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to create netlink socket");
    }
    // SAFETY: fd was just created and verified valid.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn netlink_exchange(request: &[u8]) -> Result<OwnedFd> {
    let sock = netlink_socket()?;

    // SAFETY: sockaddr_nl is plain old data; pid 0 addresses the kernel.
    let kernel: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    let mut kernel = kernel;
    kernel.nl_family = libc::AF_NETLINK as libc::sa_family_t;

    // SAFETY: request points to a complete netlink message built by the caller.
    let sent = unsafe {
        libc::sendto(
            sock.as_raw_fd(),
            request.as_ptr() as *const libc::c_void,
            request.len(),
            0,
            &kernel as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(std::io::Error::last_os_error()).context("netlink send failed");
    }
    Ok(sock)
}

fn recv_datagram(sock: &OwnedFd, buf: &mut [u8]) -> Result<usize> {
    // SAFETY: buf is a valid writable buffer of the given length.
    let n = unsafe {
        libc::recv(
            sock.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
        )
    };
    if n < 0 {
        return Err(std::io::Error::last_os_error()).context("netlink recv failed");
    }
    Ok(n as usize)
}

/// Enumerate global IPv6 addresses of an interface with their lifetimes.
///
/// Link-local and host-scope addresses are filtered out; at most `max`
/// entries are returned.
pub fn interface_addresses(ifindex: u32, max: usize) -> Result<Vec<AddrEntry>> {
    let mut request = Vec::with_capacity(NLMSG_HDRLEN + 8);
    let hdr = libc::nlmsghdr {
        nlmsg_len: (NLMSG_HDRLEN + std::mem::size_of::<IfAddrMsg>()) as u32,
        nlmsg_type: libc::RTM_GETADDR,
        nlmsg_flags: (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16,
        nlmsg_seq: 1,
        nlmsg_pid: 0,
    };
    put_struct(&mut request, &hdr);
    put_struct(
        &mut request,
        &IfAddrMsg {
            ifa_family: libc::AF_INET6 as u8,
            ifa_prefixlen: 0,
            ifa_flags: 0,
            ifa_scope: 0,
            ifa_index: 0,
        },
    );

    let sock = netlink_exchange(&request)?;

    let mut entries = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = recv_datagram(&sock, &mut buf)?;
        if n == 0 {
            break;
        }
        if parse_addr_datagram(&buf[..n], ifindex, max, &mut entries)? {
            break;
        }
    }
    Ok(entries)
}

/// Parse one datagram of an address dump. Returns true when NLMSG_DONE was
/// seen.
fn parse_addr_datagram(
    data: &[u8],
    ifindex: u32,
    max: usize,
    entries: &mut Vec<AddrEntry>,
) -> Result<bool> {
    let mut off = 0;
    while off + NLMSG_HDRLEN <= data.len() {
        // SAFETY: bounds checked above; read_unaligned tolerates any offset.
        let hdr: libc::nlmsghdr =
            unsafe { std::ptr::read_unaligned(data[off..].as_ptr() as *const libc::nlmsghdr) };
        let msg_len = hdr.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || off + msg_len > data.len() {
            break;
        }

        if hdr.nlmsg_type == libc::NLMSG_DONE as u16 {
            return Ok(true);
        }
        if hdr.nlmsg_type == libc::NLMSG_ERROR as u16 {
            bail!("netlink address dump returned an error");
        }
        if hdr.nlmsg_type == libc::RTM_NEWADDR {
            parse_addr_message(&data[off + NLMSG_HDRLEN..off + msg_len], ifindex, max, entries);
        }

        off += nl_align(msg_len);
    }
    Ok(false)
}

fn parse_addr_message(payload: &[u8], ifindex: u32, max: usize, entries: &mut Vec<AddrEntry>) {
    let ifa_len = std::mem::size_of::<IfAddrMsg>();
    if payload.len() < ifa_len || entries.len() >= max {
        return;
    }
    // SAFETY: bounds checked above.
    let ifa: IfAddrMsg = unsafe { std::ptr::read_unaligned(payload.as_ptr() as *const IfAddrMsg) };
    if ifa.ifa_family != libc::AF_INET6 as u8
        || ifa.ifa_index != ifindex
        || ifa.ifa_scope != RT_SCOPE_UNIVERSE
    {
        return;
    }

    let mut addr: Option<Ipv6Addr> = None;
    let mut preferred = u32::MAX;
    let mut valid = u32::MAX;

    let mut pos = ifa_len;
    while pos + 4 <= payload.len() {
        let rta_len = u16::from_ne_bytes([payload[pos], payload[pos + 1]]) as usize;
        let rta_type = u16::from_ne_bytes([payload[pos + 2], payload[pos + 3]]);
        if rta_len < 4 || pos + rta_len > payload.len() {
            break;
        }
        let value = &payload[pos + 4..pos + rta_len];
        match rta_type {
            IFA_ADDRESS if value.len() == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(value);
                addr = Some(Ipv6Addr::from(octets));
            }
            IFA_CACHEINFO if value.len() >= 8 => {
                preferred =
                    u32::from_ne_bytes([value[0], value[1], value[2], value[3]]);
                valid = u32::from_ne_bytes([value[4], value[5], value[6], value[7]]);
            }
            _ => {}
        }
        pos += nl_align(rta_len);
    }

    if let Some(addr) = addr {
        entries.push(AddrEntry {
            addr,
            prefix_len: ifa.ifa_prefixlen,
            preferred,
            valid,
        });
    }
}

/// Install (or replace) a /128 host route through the given interface.
pub fn add_host_route(dest: Ipv6Addr, ifindex: u32) -> Result<()> {
    let rtm_len = std::mem::size_of::<RtMsg>();
    // RTA_DST (4 + 16) + RTA_OIF (4 + 4)
    let total = NLMSG_HDRLEN + rtm_len + 20 + 8;

    let mut request = Vec::with_capacity(total);
    let hdr = libc::nlmsghdr {
        nlmsg_len: total as u32,
        nlmsg_type: libc::RTM_NEWROUTE,
        nlmsg_flags: (libc::NLM_F_REQUEST
            | libc::NLM_F_CREATE
            | libc::NLM_F_REPLACE
            | libc::NLM_F_ACK) as u16,
        nlmsg_seq: 1,
        nlmsg_pid: 0,
    };
    put_struct(&mut request, &hdr);
    put_struct(
        &mut request,
        &RtMsg {
            rtm_family: libc::AF_INET6 as u8,
            rtm_dst_len: 128,
            rtm_src_len: 0,
            rtm_tos: 0,
            rtm_table: RT_TABLE_MAIN,
            rtm_protocol: RTPROT_BOOT,
            rtm_scope: RT_SCOPE_LINK,
            rtm_type: RTN_UNICAST,
            rtm_flags: 0,
        },
    );
    request.extend_from_slice(&20u16.to_ne_bytes());
    request.extend_from_slice(&RTA_DST.to_ne_bytes());
    request.extend_from_slice(&dest.octets());
    request.extend_from_slice(&8u16.to_ne_bytes());
    request.extend_from_slice(&RTA_OIF.to_ne_bytes());
    request.extend_from_slice(&ifindex.to_ne_bytes());

    let sock = netlink_exchange(&request)?;

    let mut buf = [0u8; 1024];
    let n = recv_datagram(&sock, &mut buf)?;
    if n < NLMSG_HDRLEN + 4 {
        bail!("short netlink ack");
    }
    // SAFETY: length checked above.
    let hdr: libc::nlmsghdr =
        unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const libc::nlmsghdr) };
    if hdr.nlmsg_type != libc::NLMSG_ERROR as u16 {
        bail!("unexpected netlink reply type {}", hdr.nlmsg_type);
    }
    let errno = i32::from_ne_bytes([
        buf[NLMSG_HDRLEN],
        buf[NLMSG_HDRLEN + 1],
        buf[NLMSG_HDRLEN + 2],
        buf[NLMSG_HDRLEN + 3],
    ]);
    if errno != 0 {
        return Err(std::io::Error::from_raw_os_error(-errno))
            .with_context(|| format!("failed to install route to {}/128", dest));
    }
    Ok(())
}
