// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Socket creation and configuration helpers.
//!
//! All sockets are created non-blocking and close-on-exec. The raw libc
//! wrappers centralize error handling so the engines never touch errno
//! directly.

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Linux leaves these out of the portable libc surface.
const ICMPV6_FILTER: libc::c_int = 1;
const IPV6_CHECKSUM: libc::c_int = 7;

/// Hop limit required for Neighbor Discovery packets (RFC 4861)
const ND_HOP_LIMIT: libc::c_int = 255;

/// Relay envelopes are capped at 32 hops; used as the multicast hop limit on
/// the DHCPv6 sockets.
const DHCPV6_HOP_LIMIT: libc::c_int = 32;

/// Check a libc function result and convert to anyhow::Result
fn check_libc_result(result: i32, context: &str) -> Result<()> {
    if result < 0 {
        Err(anyhow::anyhow!(
            "Failed to {}: {}",
            context,
            std::io::Error::last_os_error()
        ))
    } else {
        Ok(())
    }
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int, what: &str) -> Result<()> {
    // SAFETY: setsockopt with a c_int value of the correct size; fd validity
    // is the caller's responsibility.
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    check_libc_result(res, what)
}

/// ICMPv6 type filter (RFC 3542). A set bit blocks the type.
#[repr(C)]
struct Icmp6Filter {
    data: [u32; 8],
}

impl Icmp6Filter {
    fn block_all() -> Self {
        Self { data: [!0u32; 8] }
    }

    fn pass(&mut self, icmp_type: u8) {
        self.data[(icmp_type >> 5) as usize] &= !(1u32 << (icmp_type & 31));
    }
}

/// Create a raw ICMPv6 socket passing only the given message types.
///
/// The kernel computes checksums (offset 2 into the ICMPv6 header), the hop
/// limit is pinned to 255 as RFC 4861 requires, and `IPV6_RECVPKTINFO` is
/// enabled so the multiplexer can attribute ingress to an interface.
pub fn create_icmpv6_socket(pass_types: &[u8]) -> Result<OwnedFd> {
    let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))
        .context("Failed to create ICMPv6 socket")?;
    socket.set_nonblocking(true)?;
    let fd = socket.as_raw_fd();

    setsockopt_int(fd, libc::IPPROTO_RAW, IPV6_CHECKSUM, 2, "set IPV6_CHECKSUM")?;
    setsockopt_int(
        fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_MULTICAST_HOPS,
        ND_HOP_LIMIT,
        "set IPV6_MULTICAST_HOPS",
    )?;
    setsockopt_int(
        fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_UNICAST_HOPS,
        ND_HOP_LIMIT,
        "set IPV6_UNICAST_HOPS",
    )?;
    setsockopt_int(
        fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_RECVPKTINFO,
        1,
        "set IPV6_RECVPKTINFO",
    )?;

    let mut filter = Icmp6Filter::block_all();
    for t in pass_types {
        filter.pass(*t);
    }
    // SAFETY: the filter is a plain 32-byte bitmap matching the kernel layout.
    let res = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_ICMPV6,
            ICMPV6_FILTER,
            &filter as *const _ as *const libc::c_void,
            std::mem::size_of::<Icmp6Filter>() as libc::socklen_t,
        )
    };
    check_libc_result(res, "set ICMP6_FILTER")?;

    Ok(OwnedFd::from(socket))
}

/// Create a DHCPv6 UDP socket bound to `[::]:port`.
pub fn create_dhcpv6_socket(port: u16) -> Result<OwnedFd> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
        .with_context(|| format!("Failed to create DHCPv6 socket on port {}", port))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let fd = socket.as_raw_fd();

    setsockopt_int(
        fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_RECVPKTINFO,
        1,
        "set IPV6_RECVPKTINFO",
    )?;
    setsockopt_int(
        fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_MULTICAST_HOPS,
        DHCPV6_HOP_LIMIT,
        "set IPV6_MULTICAST_HOPS",
    )?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("Failed to bind DHCPv6 socket to port {}", port))?;

    Ok(OwnedFd::from(socket))
}

/// Join an IPv6 multicast group on a specific interface.
pub fn join_ipv6_multicast(fd: RawFd, group: Ipv6Addr, interface_index: u32) -> Result<()> {
    let mreq = libc::ipv6_mreq {
        ipv6mr_multiaddr: libc::in6_addr {
            s6_addr: group.octets(),
        },
        ipv6mr_interface: interface_index,
    };

    // SAFETY: setsockopt with a correctly sized ipv6_mreq.
    let res = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_ADD_MEMBERSHIP,
            &mreq as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
        )
    };
    check_libc_result(res, &format!("join multicast group {}", group))
}

/// Disable multicast loopback (the RD server would otherwise hear its own RAs).
pub fn set_multicast_loop(fd: RawFd, enabled: bool) -> Result<()> {
    setsockopt_int(
        fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_MULTICAST_LOOP,
        enabled as libc::c_int,
        "set IPV6_MULTICAST_LOOP",
    )
}

/// Bind a socket to a specific network interface using SO_BINDTODEVICE.
pub fn bind_to_device(fd: RawFd, interface_name: &str) -> Result<()> {
    // SAFETY: the kernel copies at most interface_name.len() bytes.
    let res = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            interface_name.as_ptr() as *const libc::c_void,
            interface_name.len() as libc::socklen_t,
        )
    };
    check_libc_result(res, &format!("bind to device {}", interface_name))
}

// Classic BPF instruction constants
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_B: u16 = 0x10;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

// SKF_AD_OFF + SKF_AD_PKTTYPE loads skb->pkt_type
const SKF_AD_OFF: u32 = 0xFFFF_F000;
const SKF_AD_PKTTYPE: u32 = 4;
const PACKET_OUTGOING: u32 = 4;

const IPPROTO_ICMPV6_U32: u32 = 58;
const ND_NEIGHBOR_SOLICIT_U32: u32 = 135;
const ND_NEIGHBOR_ADVERT_U32: u32 = 136;

#[repr(C)]
#[derive(Clone, Copy)]
struct SockFilter {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

/// Attach a BPF filter accepting only incoming ICMPv6 Neighbor
/// Solicitations/Advertisements.
///
/// The packet starts at the IPv6 header (`SOCK_DGRAM` packet socket). Frames
/// originating from this host are dropped in the kernel, otherwise proxied
/// advertisements would loop straight back into the proxy.
///
/// BPF program:
/// ```text
/// LD   pkt_type            ; JEQ #PACKET_OUTGOING -> drop
/// LDB  [6]                 ; JNE #58  -> drop (IPv6 next header)
/// LDB  [40]                ; JEQ #135 -> accept
///                          ; JEQ #136 -> accept, else drop
/// ```
fn attach_nd_filter(fd: RawFd) -> Result<()> {
    let filter: [SockFilter; 9] = [
        SockFilter {
            code: BPF_LD | BPF_W | BPF_ABS,
            jt: 0,
            jf: 0,
            k: SKF_AD_OFF + SKF_AD_PKTTYPE,
        },
        SockFilter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 6,
            jf: 0,
            k: PACKET_OUTGOING,
        },
        SockFilter {
            code: BPF_LD | BPF_B | BPF_ABS,
            jt: 0,
            jf: 0,
            k: 6,
        },
        SockFilter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 0,
            jf: 4,
            k: IPPROTO_ICMPV6_U32,
        },
        SockFilter {
            code: BPF_LD | BPF_B | BPF_ABS,
            jt: 0,
            jf: 0,
            k: 40,
        },
        SockFilter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 1,
            jf: 0,
            k: ND_NEIGHBOR_SOLICIT_U32,
        },
        SockFilter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 0,
            jf: 1,
            k: ND_NEIGHBOR_ADVERT_U32,
        },
        // accept
        SockFilter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: 0xFFFF,
        },
        // drop
        SockFilter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: 0,
        },
    ];

    let prog = SockFprog {
        len: filter.len() as u16,
        filter: filter.as_ptr(),
    };

    // SAFETY: prog points to a well-formed sock_fprog; the kernel verifies the
    // program before attaching it.
    let res = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &prog as *const _ as *const libc::c_void,
            std::mem::size_of::<SockFprog>() as libc::socklen_t,
        )
    };
    check_libc_result(res, "attach BPF neighbor-discovery filter (SO_ATTACH_FILTER)")
}

/// Create the AF_PACKET socket the NDP proxy listens on.
///
/// Bound to all interfaces (ifindex 0); `SOCK_DGRAM` strips the ethernet
/// header so payloads start at the IPv6 header.
pub fn create_ndp_packet_socket() -> Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the return value is checked before use.
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            (libc::ETH_P_IPV6 as u16).to_be() as libc::c_int,
        )
    };
    if fd < 0 {
        return Err(anyhow::anyhow!(
            "Failed to create AF_PACKET socket: {}",
            std::io::Error::last_os_error()
        ));
    }
    // SAFETY: fd was just created and verified valid.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: sockaddr_ll is correctly initialized for AF_PACKET; ifindex 0
    // binds to every interface.
    unsafe {
        let sockaddr_ll = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: (libc::ETH_P_IPV6 as u16).to_be(),
            sll_ifindex: 0,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };
        let res = libc::bind(
            owned.as_raw_fd(),
            &sockaddr_ll as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        );
        check_libc_result(res, "bind AF_PACKET socket")?;
    }

    attach_nd_filter(owned.as_raw_fd())?;
    Ok(owned)
}
