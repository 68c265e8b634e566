// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Router Discovery engine (RFC 4861, RDNSS/DNSSL per RFC 8106).
//!
//! Two modes share one raw ICMPv6 socket:
//!
//! - *Relay*: advertisements heard on the master are copied to every slave
//!   with the source link-layer option rewritten; solicitations heard on a
//!   slave trigger one bare solicitation out the master.
//! - *Server*: each slave owns a timer; on expiry (or an incoming
//!   solicitation) an advertisement is synthesized from the slave's own
//!   addresses.

use crate::config::RelaydConfig;
use crate::engines::{PacketWriter, ALL_NODES, ALL_ROUTERS};
use crate::logging::{Facility, Logger};
use crate::mux::{EventLoop, MonotonicTimer, RecvSource};
use crate::platform::interface::{interface_mtu, Interface, InterfaceRegistry};
use crate::platform::netlink::AddrEntry;
use crate::platform::{forward, netlink, resolver, routes, sockets, sysctl};
use anyhow::{Context, Result};
use rand::Rng;
use std::cell::RefCell;
use std::io::IoSlice;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::time::Duration;

pub const ND_ROUTER_SOLICIT: u8 = 133;
pub const ND_ROUTER_ADVERT: u8 = 134;

pub const ND_OPT_SOURCE_LINKADDR: u8 = 1;
pub const ND_OPT_PREFIX_INFORMATION: u8 = 3;
pub const ND_OPT_MTU: u8 = 5;
pub const ND_OPT_RECURSIVE_DNS: u8 = 25;
pub const ND_OPT_DNS_SEARCH: u8 = 31;

/// Flags/reserved byte of an RA (offset 5)
pub const RA_FLAG_OTHER: u8 = 0x40;
pub const RA_FLAG_PROXY: u8 = 0x04;

const PIO_FLAG_ONLINK: u8 = 0x80;
const PIO_FLAG_AUTO: u8 = 0x40;

pub const RA_HEADER_LEN: usize = 16;

/// RFC 4861 defaults, seconds
pub const MAX_RTR_ADV_INTERVAL: u32 = 600;
pub const MIN_RTR_ADV_INTERVAL: u32 = 200;

/// Advertised lifetimes are clamped to two years
pub const MAX_VALID_TIME: u32 = 2 * 365 * 86400;

/// Upper bound on Prefix Information options per advertisement
pub const MAX_PREFIXES: usize = 16;

/// Iterator over ICMPv6 ND options: yields (type, offset, length) within the
/// options region. A zero length or a truncated option ends iteration.
pub(crate) struct NdOptions<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> NdOptions<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for NdOptions<'a> {
    type Item = (u8, usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + 2 > self.data.len() {
            return None;
        }
        let opt_type = self.data[self.pos];
        let size = self.data[self.pos + 1] as usize * 8;
        if size == 0 || self.pos + size > self.data.len() {
            return None;
        }
        let item = (opt_type, self.pos, size);
        self.pos += size;
        Some(item)
    }
}

/// Offsets of the rewritable parts of a relayed advertisement.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AdvertLayout {
    /// Offset of the 6 MAC bytes inside the source link-layer option
    pub mac_offset: Option<usize>,
    /// Offset of the first RDNSS address
    pub dns_offset: Option<usize>,
    pub dns_count: usize,
}

/// Locate the source link-layer option and the RDNSS addresses of an RA.
pub fn scan_advert(data: &[u8]) -> Option<AdvertLayout> {
    if data.len() < RA_HEADER_LEN || data[0] != ND_ROUTER_ADVERT {
        return None;
    }
    let mut layout = AdvertLayout::default();
    for (opt_type, offset, size) in NdOptions::new(&data[RA_HEADER_LEN..]) {
        let abs = RA_HEADER_LEN + offset;
        match opt_type {
            ND_OPT_SOURCE_LINKADDR if size >= 8 => layout.mac_offset = Some(abs + 2),
            ND_OPT_RECURSIVE_DNS if size > 8 => {
                layout.dns_offset = Some(abs + 8);
                layout.dns_count = (size - 8) / 16;
            }
            _ => {}
        }
    }
    Some(layout)
}

/// Rewrite one copy of a relayed advertisement for a particular slave.
///
/// Sets the PROXY bit, optionally the OTHER bit, replaces the source
/// link-layer address and, when a rewrite address is given, every RDNSS
/// address.
pub fn rewrite_advert_for_slave(
    buf: &mut [u8],
    layout: &AdvertLayout,
    slave_mac: &[u8; 6],
    dns_rewrite: Option<Ipv6Addr>,
    announce_dhcpv6: bool,
) {
    buf[5] |= RA_FLAG_PROXY;
    if announce_dhcpv6 {
        buf[5] |= RA_FLAG_OTHER;
    }
    if let Some(offset) = layout.mac_offset {
        buf[offset..offset + 6].copy_from_slice(slave_mac);
    }
    if let (Some(offset), Some(addr)) = (layout.dns_offset, dns_rewrite) {
        for i in 0..layout.dns_count {
            let at = offset + 16 * i;
            buf[at..at + 16].copy_from_slice(&addr.octets());
        }
    }
}

/// A bare Router Solicitation: ICMPv6 header only, no options.
pub fn build_router_solicitation() -> [u8; 8] {
    [ND_ROUTER_SOLICIT, 0, 0, 0, 0, 0, 0, 0]
}

/// Encode a domain into DNS wire format (length-prefixed labels).
pub fn encode_dns_name(name: &str) -> Option<Vec<u8>> {
    let mut encoded = Vec::with_capacity(name.len() + 2);
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return None;
        }
        encoded.push(label.len() as u8);
        encoded.extend_from_slice(label.as_bytes());
    }
    encoded.push(0);
    if encoded.len() > 255 {
        return None;
    }
    Some(encoded)
}

/// Everything the synthesizer reads from the outside world, gathered up
/// front so the construction itself is pure.
pub struct RaContext {
    pub mtu: u32,
    pub have_default_route: bool,
    pub addrs: Vec<AddrEntry>,
    pub search_domain: Option<String>,
    pub in_shutdown: bool,
}

#[derive(Clone)]
struct PendingPrefix {
    prefix: [u8; 8],
    valid: u32,
    preferred: u32,
}

/// Synthesize a Router Advertisement for a slave interface.
pub fn build_router_advert(mac: &[u8; 6], ctx: &RaContext, config: &RelaydConfig) -> Vec<u8> {
    let mut prefixes: Vec<PendingPrefix> = Vec::new();
    let mut have_public = false;
    let mut pref_addr: Option<Ipv6Addr> = None;
    let mut pref_time = 0u32;

    for entry in &ctx.addrs {
        if entry.prefix_len > 64 {
            continue;
        }
        let preferred = entry.preferred.min(MAX_VALID_TIME);
        let valid = entry.valid.min(MAX_VALID_TIME);
        let octets = entry.addr.octets();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&octets[..8]);

        if octets[0] & 0xfe != 0xfc && preferred > 0 {
            have_public = true;
        }

        match prefixes.iter_mut().find(|p| p.prefix == prefix) {
            Some(existing) => {
                existing.valid = valid;
                existing.preferred = preferred;
            }
            None => {
                if prefixes.len() >= MAX_PREFIXES {
                    break;
                }
                prefixes.push(PendingPrefix {
                    prefix,
                    valid,
                    preferred,
                });
            }
        }

        if preferred > pref_time {
            pref_time = preferred;
            pref_addr = Some(entry.addr);
        }
    }

    let mut router_lifetime: u16 = 0;
    if !ctx.in_shutdown && ctx.have_default_route {
        router_lifetime = (3 * MAX_RTR_ADV_INTERVAL) as u16;
    }
    if !have_public && !config.always_announce_default_router {
        router_lifetime = 0;
    }

    if have_public && config.deprecate_ula_if_public {
        for p in prefixes.iter_mut() {
            if p.prefix[0] & 0xfe == 0xfc {
                p.preferred = 0;
            }
        }
    }

    let mut w = PacketWriter::with_capacity(RA_HEADER_LEN + 16 + 32 * prefixes.len() + 64);
    // type, code, checksum (kernel), hop limit, flags, lifetime
    w.u8(ND_ROUTER_ADVERT).u8(0).u16(0);
    w.u8(0).u8(RA_FLAG_OTHER).u16(router_lifetime);
    // reachable time, retrans timer
    w.u32(0).u32(0);

    w.u8(ND_OPT_SOURCE_LINKADDR).u8(1).bytes(mac);
    w.u8(ND_OPT_MTU).u8(1).u16(0).u32(ctx.mtu);

    for p in &prefixes {
        w.u8(ND_OPT_PREFIX_INFORMATION)
            .u8(4)
            .u8(64)
            .u8(PIO_FLAG_ONLINK | PIO_FLAG_AUTO)
            .u32(p.valid)
            .u32(p.preferred)
            .u32(0)
            .bytes(&p.prefix)
            .bytes(&[0u8; 8]);
    }

    let mut dns_addr = pref_addr;
    if config.always_rewrite_dns && config.dns_address.is_some() {
        dns_addr = config.dns_address;
    }
    if let Some(addr) = dns_addr {
        w.u8(ND_OPT_RECURSIVE_DNS).u8(3).u16(0).u32(pref_time).addr(addr);
    }

    if let Some(domain) = &ctx.search_domain {
        if let Some(mut name) = encode_dns_name(domain) {
            let padded = (name.len() + 7) & !7;
            name.resize(padded, 0);
            w.u8(ND_OPT_DNS_SEARCH)
                .u8(((8 + padded) / 8) as u8)
                .u16(0)
                .u32(3 * MAX_RTR_ADV_INTERVAL)
                .bytes(&name);
        }
    }

    w.into_vec()
}

/// The engine: owns the ICMPv6 socket and, in server mode, one timer per
/// slave.
pub struct RouterDiscovery {
    config: Rc<RelaydConfig>,
    registry: Rc<InterfaceRegistry>,
    logger: Logger,
    sock: Rc<OwnedFd>,
    timers: Vec<Rc<MonotonicTimer>>,
    in_shutdown: bool,
}

impl RouterDiscovery {
    /// Open the socket, join the discovery groups and register with the
    /// multiplexer. Returns None when router discovery is not enabled.
    pub fn init(
        config: Rc<RelaydConfig>,
        registry: Rc<InterfaceRegistry>,
        evloop: &mut EventLoop,
        logger: Logger,
    ) -> Result<Option<Rc<RefCell<Self>>>> {
        if !config.rd_relay && !config.rd_server && !config.send_router_solicitation {
            return Ok(None);
        }

        let sock = Rc::new(
            sockets::create_icmpv6_socket(&[ND_ROUTER_SOLICIT, ND_ROUTER_ADVERT])
                .context("Failed to open RAW-socket")?,
        );

        // All-routers ingress: advertisements are solicited on the master,
        // solicitations arrive on the slaves.
        sockets::join_ipv6_multicast(sock.as_raw_fd(), ALL_ROUTERS, registry.master.index)?;
        for slave in &registry.slaves {
            sockets::join_ipv6_multicast(sock.as_raw_fd(), ALL_ROUTERS, slave.index)?;
        }

        let mut timers = Vec::new();
        if config.rd_server {
            sockets::set_multicast_loop(sock.as_raw_fd(), false)?;
            for _ in &registry.slaves {
                timers.push(Rc::new(MonotonicTimer::new()?));
            }
        } else if config.rd_relay {
            // Unsolicited advertisements go to all-nodes on the master link
            sockets::join_ipv6_multicast(sock.as_raw_fd(), ALL_NODES, registry.master.index)?;
        }

        let register_dgram =
            !registry.slaves.is_empty() && (config.rd_relay || config.rd_server);
        let server_mode = config.rd_server;
        let send_initial_rs = config.send_router_solicitation;

        let this = Rc::new(RefCell::new(Self {
            config,
            registry: registry.clone(),
            logger,
            sock,
            timers,
            in_shutdown: false,
        }));

        if server_mode {
            for index in 0..registry.slaves.len() {
                let timer = this.borrow().timers[index].clone();
                let handle = this.clone();
                evloop.register_timer(
                    timer,
                    Box::new(move || handle.borrow_mut().send_router_advert(index)),
                )?;
            }
            for index in 0..registry.slaves.len() {
                this.borrow_mut().send_router_advert(index);
            }
        }

        if send_initial_rs {
            this.borrow().forward_router_solicitation();
        }

        if register_dgram {
            let handle = this.clone();
            let sock = this.borrow().sock.clone();
            evloop.register_datagram(
                sock,
                Box::new(move |source, data, iface| {
                    handle.borrow_mut().handle_icmpv6(source, data, iface)
                }),
            )?;
        }

        Ok(Some(this))
    }

    fn handle_icmpv6(&mut self, _source: &RecvSource, data: &[u8], iface: &Interface) {
        if data.len() < 8 {
            return;
        }
        let msg_type = data[0];

        if self.config.rd_server {
            if msg_type == ND_ROUTER_SOLICIT && !iface.is_master() {
                if let Some(index) = self.registry.slave_position(iface.index) {
                    self.send_router_advert(index);
                }
            }
        } else if msg_type == ND_ROUTER_ADVERT && iface.is_master() {
            self.forward_router_advertisement(data);
        } else if msg_type == ND_ROUTER_SOLICIT && !iface.is_master() {
            self.forward_router_solicitation();
        }
    }

    /// Relay an advertisement from the master to every slave, rewritten per
    /// slave. A slave for which no DNS rewrite address can be found still
    /// gets the advertisement, only the rewrite is skipped.
    fn forward_router_advertisement(&self, data: &[u8]) {
        let Some(layout) = scan_advert(data) else {
            return;
        };

        self.logger.notice(Facility::RouterDiscovery, "Got a RA");

        let dest = SocketAddrV6::new(ALL_NODES, 0, 0, 0);
        for slave in &self.registry.slaves {
            let mut buf = data.to_vec();

            let dns_rewrite = if self.config.always_rewrite_dns && layout.dns_offset.is_some() {
                self.config.dns_address.or_else(|| {
                    netlink::interface_addresses(slave.index, 1)
                        .ok()
                        .and_then(|entries| entries.first().map(|e| e.addr))
                })
            } else {
                None
            };

            rewrite_advert_for_slave(
                &mut buf,
                &layout,
                &slave.mac,
                dns_rewrite,
                self.config.dhcpv6_server,
            );

            let _ = forward::send_on(
                &self.logger,
                self.sock.as_raw_fd(),
                &dest,
                &[IoSlice::new(&buf)],
                slave,
            );
        }
    }

    /// Send one bare solicitation out the master.
    fn forward_router_solicitation(&self) {
        if self.config.force_address_assignment {
            for slave in &self.registry.slaves {
                if let Err(e) = sysctl::sysctl_interface(&slave.name, "accept_ra", "2") {
                    self.logger
                        .warning(Facility::RouterDiscovery, &format!("{:#}", e));
                }
            }
        }

        self.logger.notice(
            Facility::RouterDiscovery,
            &format!("Sending RS to {}", self.registry.master.name),
        );

        let rs = build_router_solicitation();
        let dest = SocketAddrV6::new(ALL_ROUTERS, 0, 0, 0);
        let _ = forward::send_on(
            &self.logger,
            self.sock.as_raw_fd(),
            &dest,
            &[IoSlice::new(&rs)],
            &self.registry.master,
        );
    }

    /// Server mode: synthesize and send one advertisement, then re-arm the
    /// slave's timer to a random interval.
    fn send_router_advert(&mut self, slave_index: usize) {
        let slave = self.registry.slaves[slave_index].clone();

        let mtu = interface_mtu(&slave.name).unwrap_or(1500);
        let (have_default, addrs) = if self.in_shutdown {
            (false, Vec::new())
        } else {
            let addrs = netlink::interface_addresses(slave.index, MAX_PREFIXES).unwrap_or_else(|e| {
                self.logger
                    .warning(Facility::RouterDiscovery, &format!("{:#}", e));
                Vec::new()
            });
            (routes::have_default_route(), addrs)
        };

        let ctx = RaContext {
            mtu,
            have_default_route: have_default,
            addrs,
            search_domain: resolver::first_search_domain(),
            in_shutdown: self.in_shutdown,
        };
        let advert = build_router_advert(&slave.mac, &ctx, &self.config);

        let dest = SocketAddrV6::new(ALL_NODES, 0, 0, 0);
        let _ = forward::send_on(
            &self.logger,
            self.sock.as_raw_fd(),
            &dest,
            &[IoSlice::new(&advert)],
            &slave,
        );

        if let Some(timer) = self.timers.get(slave_index) {
            let secs = rand::thread_rng()
                .gen_range(MIN_RTR_ADV_INTERVAL as u64..MAX_RTR_ADV_INTERVAL as u64);
            let _ = timer.arm(Duration::from_secs(secs));
        }
    }

    /// Fire every slave's advertisement timer within a second.
    pub fn refresh(&self) {
        for timer in &self.timers {
            let _ = timer.arm(Duration::from_secs(1));
        }
    }

    /// Final advertisements so hosts expire their default routes, and the
    /// accept_ra override so autoconfiguration keeps working without us.
    pub fn shutdown(&mut self) {
        if self.config.rd_server {
            self.in_shutdown = true;
            for index in 0..self.registry.slaves.len() {
                self.send_router_advert(index);
            }
        }

        if self.config.rd_relay && !self.config.rd_server && self.config.force_address_assignment {
            for slave in &self.registry.slaves {
                if let Err(e) = sysctl::sysctl_interface(&slave.name, "accept_ra", "2") {
                    self.logger
                        .warning(Facility::RouterDiscovery, &format!("{:#}", e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mac() -> [u8; 6] {
        [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]
    }

    fn entry(addr: &str, prefix_len: u8, preferred: u32, valid: u32) -> AddrEntry {
        AddrEntry {
            addr: addr.parse().unwrap(),
            prefix_len,
            preferred,
            valid,
        }
    }

    fn base_ctx() -> RaContext {
        RaContext {
            mtu: 1500,
            have_default_route: true,
            addrs: vec![entry("2001:db8:1::1", 64, 1800, 3600)],
            search_domain: None,
            in_shutdown: false,
        }
    }

    /// Build a relayed-style RA: header + SLL + PIO + RDNSS
    fn sample_relayed_advert() -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.u8(ND_ROUTER_ADVERT).u8(0).u16(0);
        w.u8(64).u8(0).u16(1800);
        w.u32(0).u32(0);
        // source link-layer option
        w.u8(ND_OPT_SOURCE_LINKADDR)
            .u8(1)
            .bytes(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        // prefix information option
        w.u8(ND_OPT_PREFIX_INFORMATION)
            .u8(4)
            .u8(64)
            .u8(0xc0)
            .u32(86400)
            .u32(14400)
            .u32(0)
            .addr("2001:db8:1::".parse().unwrap());
        // RDNSS with one server
        w.u8(ND_OPT_RECURSIVE_DNS)
            .u8(3)
            .u16(0)
            .u32(1800)
            .addr("2001:db8:1::1".parse().unwrap());
        w.into_vec()
    }

    #[test]
    fn test_nd_option_walker() {
        let advert = sample_relayed_advert();
        let options: Vec<(u8, usize, usize)> = NdOptions::new(&advert[RA_HEADER_LEN..]).collect();
        assert_eq!(options.len(), 3);
        assert_eq!(options[0].0, ND_OPT_SOURCE_LINKADDR);
        assert_eq!(options[0].2, 8);
        assert_eq!(options[1].0, ND_OPT_PREFIX_INFORMATION);
        assert_eq!(options[1].2, 32);
        assert_eq!(options[2].0, ND_OPT_RECURSIVE_DNS);
        assert_eq!(options[2].2, 24);
    }

    #[test]
    fn test_nd_option_walker_zero_length_stops() {
        let data = [1u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(NdOptions::new(&data).count(), 0);
    }

    #[test]
    fn test_nd_option_walker_truncated_stops() {
        // Claims 16 bytes, only 8 present
        let data = [1u8, 2, 0, 0, 0, 0, 0, 0];
        assert_eq!(NdOptions::new(&data).count(), 0);
    }

    #[test]
    fn test_scan_advert_layout() {
        let advert = sample_relayed_advert();
        let layout = scan_advert(&advert).unwrap();
        assert_eq!(layout.mac_offset, Some(RA_HEADER_LEN + 2));
        assert_eq!(layout.dns_count, 1);
        let dns_off = layout.dns_offset.unwrap();
        assert_eq!(
            &advert[dns_off..dns_off + 16],
            &"2001:db8:1::1".parse::<Ipv6Addr>().unwrap().octets()
        );
    }

    #[test]
    fn test_scan_advert_rejects_non_advert() {
        let rs = build_router_solicitation();
        assert!(scan_advert(&rs).is_none());
        assert!(scan_advert(&[]).is_none());
    }

    #[test]
    fn test_rewrite_replaces_mac_and_sets_proxy() {
        let original = sample_relayed_advert();
        let layout = scan_advert(&original).unwrap();
        let mut buf = original.clone();

        rewrite_advert_for_slave(&mut buf, &layout, &sample_mac(), None, false);

        assert_eq!(buf[5] & RA_FLAG_PROXY, RA_FLAG_PROXY);
        assert_eq!(buf[5] & RA_FLAG_OTHER, 0);
        let mac_off = layout.mac_offset.unwrap();
        assert_eq!(&buf[mac_off..mac_off + 6], &sample_mac());
        // The upstream MAC appears nowhere in the rewritten packet
        assert!(!buf
            .windows(6)
            .any(|w| w == [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]));
        // Router lifetime and the prefix option are untouched
        assert_eq!(&buf[6..8], &original[6..8]);
        assert_eq!(&buf[24..56], &original[24..56]);
    }

    #[test]
    fn test_rewrite_dns_and_other_flag() {
        let original = sample_relayed_advert();
        let layout = scan_advert(&original).unwrap();
        let mut buf = original;

        let rewrite: Ipv6Addr = "2001:db8:1::1234".parse().unwrap();
        rewrite_advert_for_slave(&mut buf, &layout, &sample_mac(), Some(rewrite), true);

        assert_eq!(buf[5] & RA_FLAG_OTHER, RA_FLAG_OTHER);
        let dns_off = layout.dns_offset.unwrap();
        assert_eq!(&buf[dns_off..dns_off + 16], &rewrite.octets());
    }

    #[test]
    fn test_solicitation_is_bare() {
        let rs = build_router_solicitation();
        assert_eq!(rs.len(), 8);
        assert_eq!(rs[0], ND_ROUTER_SOLICIT);
        assert!(rs[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_encode_dns_name() {
        assert_eq!(
            encode_dns_name("lan.example.org").unwrap(),
            b"\x03lan\x07example\x03org\x00".to_vec()
        );
        assert_eq!(encode_dns_name("home.arpa.").unwrap(), b"\x04home\x04arpa\x00");
        assert!(encode_dns_name("a..b").is_none());
        assert!(encode_dns_name(&"x".repeat(64)).is_none());
    }

    #[test]
    fn test_advert_lifetime_with_default_route() {
        let advert = build_router_advert(&sample_mac(), &base_ctx(), &RelaydConfig::default());
        assert_eq!(advert[0], ND_ROUTER_ADVERT);
        assert_eq!(advert[5] & RA_FLAG_OTHER, RA_FLAG_OTHER);
        assert_eq!(u16::from_be_bytes([advert[6], advert[7]]), 1800);
    }

    #[test]
    fn test_advert_lifetime_without_default_route() {
        let ctx = RaContext {
            have_default_route: false,
            ..base_ctx()
        };
        let advert = build_router_advert(&sample_mac(), &ctx, &RelaydConfig::default());
        assert_eq!(u16::from_be_bytes([advert[6], advert[7]]), 0);
    }

    #[test]
    fn test_advert_lifetime_zero_for_ula_only() {
        let ctx = RaContext {
            addrs: vec![entry("fd00:1::1", 64, 1800, 3600)],
            ..base_ctx()
        };
        let advert = build_router_advert(&sample_mac(), &ctx, &RelaydConfig::default());
        assert_eq!(u16::from_be_bytes([advert[6], advert[7]]), 0);

        let config = RelaydConfig {
            always_announce_default_router: true,
            ..Default::default()
        };
        let advert = build_router_advert(&sample_mac(), &ctx, &config);
        assert_eq!(u16::from_be_bytes([advert[6], advert[7]]), 1800);
    }

    #[test]
    fn test_shutdown_advert_has_zero_lifetime() {
        let ctx = RaContext {
            addrs: Vec::new(),
            have_default_route: false,
            in_shutdown: true,
            ..base_ctx()
        };
        let advert = build_router_advert(&sample_mac(), &ctx, &RelaydConfig::default());
        assert_eq!(u16::from_be_bytes([advert[6], advert[7]]), 0);
        // Still a valid advertisement with SLL + MTU options
        let options: Vec<_> = NdOptions::new(&advert[RA_HEADER_LEN..]).collect();
        assert!(options.len() >= 2);
    }

    #[test]
    fn test_advert_mtu_and_source_lladdr_options() {
        let advert = build_router_advert(&sample_mac(), &base_ctx(), &RelaydConfig::default());
        let options: Vec<_> = NdOptions::new(&advert[RA_HEADER_LEN..]).collect();

        let (_, sll_off, _) = options
            .iter()
            .find(|(t, _, _)| *t == ND_OPT_SOURCE_LINKADDR)
            .unwrap();
        assert_eq!(&advert[RA_HEADER_LEN + sll_off + 2..RA_HEADER_LEN + sll_off + 8], &sample_mac());

        let (_, mtu_off, _) = options.iter().find(|(t, _, _)| *t == ND_OPT_MTU).unwrap();
        let at = RA_HEADER_LEN + mtu_off + 4;
        assert_eq!(
            u32::from_be_bytes([advert[at], advert[at + 1], advert[at + 2], advert[at + 3]]),
            1500
        );
    }

    #[test]
    fn test_advert_prefix_merge_and_clamp() {
        let ctx = RaContext {
            addrs: vec![
                entry("2001:db8:1::1", 64, u32::MAX, u32::MAX),
                entry("2001:db8:1::2", 64, 1800, 3600),
                entry("2001:db8:2::1", 64, 600, 1200),
                entry("2001:db8:3::1", 72, 600, 1200), // prefix too long, skipped
            ],
            ..base_ctx()
        };
        let advert = build_router_advert(&sample_mac(), &ctx, &RelaydConfig::default());

        let pios: Vec<usize> = NdOptions::new(&advert[RA_HEADER_LEN..])
            .filter(|(t, _, _)| *t == ND_OPT_PREFIX_INFORMATION)
            .map(|(_, off, _)| RA_HEADER_LEN + off)
            .collect();
        assert_eq!(pios.len(), 2, "same /64 must be merged, /72 skipped");

        // The merged 2001:db8:1::/64 entry carries the *last* seen lifetimes
        let first = pios[0];
        assert_eq!(advert[first + 2], 64); // prefix length
        assert_eq!(advert[first + 3], PIO_FLAG_ONLINK | PIO_FLAG_AUTO);
        let valid = u32::from_be_bytes(advert[first + 4..first + 8].try_into().unwrap());
        let preferred = u32::from_be_bytes(advert[first + 8..first + 12].try_into().unwrap());
        assert_eq!(valid, 3600);
        assert_eq!(preferred, 1800);
    }

    #[test]
    fn test_advert_clamps_infinite_lifetimes() {
        let ctx = RaContext {
            addrs: vec![entry("2001:db8:1::1", 64, u32::MAX, u32::MAX)],
            ..base_ctx()
        };
        let advert = build_router_advert(&sample_mac(), &ctx, &RelaydConfig::default());
        let (_, off, _) = NdOptions::new(&advert[RA_HEADER_LEN..])
            .find(|(t, _, _)| *t == ND_OPT_PREFIX_INFORMATION)
            .unwrap();
        let at = RA_HEADER_LEN + off;
        let valid = u32::from_be_bytes(advert[at + 4..at + 8].try_into().unwrap());
        assert_eq!(valid, MAX_VALID_TIME);
    }

    #[test]
    fn test_advert_ula_deprecation() {
        let config = RelaydConfig {
            deprecate_ula_if_public: true,
            ..Default::default()
        };
        let ctx = RaContext {
            addrs: vec![
                entry("2001:db8:1::1", 64, 1800, 3600),
                entry("fd00:1::1", 64, 1800, 3600),
            ],
            ..base_ctx()
        };
        let advert = build_router_advert(&sample_mac(), &ctx, &config);

        for (_, off, _) in
            NdOptions::new(&advert[RA_HEADER_LEN..]).filter(|(t, _, _)| *t == ND_OPT_PREFIX_INFORMATION)
        {
            let at = RA_HEADER_LEN + off;
            let preferred = u32::from_be_bytes(advert[at + 8..at + 12].try_into().unwrap());
            if advert[at + 16] & 0xfe == 0xfc {
                assert_eq!(preferred, 0, "ULA prefix must be deprecated");
            } else {
                assert_eq!(preferred, 1800);
            }
        }
    }

    #[test]
    fn test_advert_rdnss_selection() {
        // Longest preferred lifetime wins
        let ctx = RaContext {
            addrs: vec![
                entry("2001:db8:1::1", 64, 600, 1200),
                entry("2001:db8:2::1", 64, 1800, 3600),
            ],
            ..base_ctx()
        };
        let advert = build_router_advert(&sample_mac(), &ctx, &RelaydConfig::default());
        let (_, off, _) = NdOptions::new(&advert[RA_HEADER_LEN..])
            .find(|(t, _, _)| *t == ND_OPT_RECURSIVE_DNS)
            .unwrap();
        let at = RA_HEADER_LEN + off;
        let lifetime = u32::from_be_bytes(advert[at + 4..at + 8].try_into().unwrap());
        assert_eq!(lifetime, 1800);
        assert_eq!(
            &advert[at + 8..at + 24],
            &"2001:db8:2::1".parse::<Ipv6Addr>().unwrap().octets()
        );

        // Configured DNS overrides the detected address
        let config = RelaydConfig {
            always_rewrite_dns: true,
            dns_address: Some("2001:db8::53".parse().unwrap()),
            ..Default::default()
        };
        let advert = build_router_advert(&sample_mac(), &ctx, &config);
        let (_, off, _) = NdOptions::new(&advert[RA_HEADER_LEN..])
            .find(|(t, _, _)| *t == ND_OPT_RECURSIVE_DNS)
            .unwrap();
        let at = RA_HEADER_LEN + off;
        assert_eq!(
            &advert[at + 8..at + 24],
            &"2001:db8::53".parse::<Ipv6Addr>().unwrap().octets()
        );
    }

    #[test]
    fn test_advert_no_rdnss_without_addresses() {
        let ctx = RaContext {
            addrs: Vec::new(),
            ..base_ctx()
        };
        let advert = build_router_advert(&sample_mac(), &ctx, &RelaydConfig::default());
        assert!(NdOptions::new(&advert[RA_HEADER_LEN..])
            .all(|(t, _, _)| t != ND_OPT_RECURSIVE_DNS));
    }

    #[test]
    fn test_advert_dns_search_list() {
        let ctx = RaContext {
            search_domain: Some("lan.example.org".to_string()),
            ..base_ctx()
        };
        let advert = build_router_advert(&sample_mac(), &ctx, &RelaydConfig::default());
        let (_, off, size) = NdOptions::new(&advert[RA_HEADER_LEN..])
            .find(|(t, _, _)| *t == ND_OPT_DNS_SEARCH)
            .unwrap();
        let at = RA_HEADER_LEN + off;
        // encoded name is 17 bytes, padded to 24; option total 8 + 24 = 32
        assert_eq!(size, 32);
        let lifetime = u32::from_be_bytes(advert[at + 4..at + 8].try_into().unwrap());
        assert_eq!(lifetime, 1800);
        assert_eq!(&advert[at + 8..at + 25], b"\x03lan\x07example\x03org\x00");
        assert!(advert[at + 25..at + 32].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_advert_prefix_cap() {
        let addrs: Vec<AddrEntry> = (0..MAX_PREFIXES + 4)
            .map(|i| entry(&format!("2001:db8:{:x}::1", i + 1), 64, 1800, 3600))
            .collect();
        let ctx = RaContext {
            addrs,
            ..base_ctx()
        };
        let advert = build_router_advert(&sample_mac(), &ctx, &RelaydConfig::default());
        let count = NdOptions::new(&advert[RA_HEADER_LEN..])
            .filter(|(t, _, _)| *t == ND_OPT_PREFIX_INFORMATION)
            .count();
        assert_eq!(count, MAX_PREFIXES);
    }
}
