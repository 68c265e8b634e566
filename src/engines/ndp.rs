// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Neighbor Discovery proxy (RFC 4861; proxying in the spirit of RFC 4389,
//! without claiming full compliance).
//!
//! A packet socket listens for NS/NA on every interface. Solicitations for
//! addresses known on a different link are answered with a proxied
//! advertisement (router flag cleared); unknown targets are probed on the
//! other links. DAD probes are replicated everywhere. Hosts on "external"
//! slaves are never learned, so they are never proxied.

use crate::config::RelaydConfig;
use crate::engines::router::ND_OPT_SOURCE_LINKADDR;
use crate::logging::{Facility, Logger};
use crate::mux::{EventLoop, MonotonicTimer, RecvSource};
use crate::platform::interface::{Interface, InterfaceRegistry};
use crate::platform::{forward, netlink, sockets, sysctl};
use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::IoSlice;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const ND_NEIGHBOR_SOLICIT: u8 = 135;
pub const ND_NEIGHBOR_ADVERT: u8 = 136;

const ND_OPT_TARGET_LINKADDR: u8 = 2;

const NA_FLAG_SOLICITED: u8 = 0x40;
const NA_FLAG_OVERRIDE: u8 = 0x20;

const IPV6_HEADER_LEN: usize = 40;
/// ICMPv6 header (8) plus target address (16)
const ND_MESSAGE_LEN: usize = 24;

/// Entry aging: probes die quickly, confirmed entries degrade to stale and
/// are evicted after a long idle period.
const TENTATIVE_TIMEOUT: Duration = Duration::from_secs(5);
const REACHABLE_TIMEOUT: Duration = Duration::from_secs(30);
const STALE_TIMEOUT: Duration = Duration::from_secs(600);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    /// Probe sent, no confirmation yet
    Tentative,
    /// Advertisement seen recently
    Reachable,
    /// No traffic for a while; still answered for
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct NeighborEntry {
    state: NeighborState,
    last_seen: Instant,
}

/// Learned neighbor state, at most one entry per (address, interface).
/// Mutated only from the packet handler and the maintenance sweep.
#[derive(Default)]
pub struct NeighborTable {
    entries: HashMap<(Ipv6Addr, u32), NeighborEntry>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reachability confirmation. Returns true when the neighbor
    /// was not already known reachable on this interface.
    pub fn learn(&mut self, addr: Ipv6Addr, ifindex: u32, now: Instant) -> bool {
        let entry = self.entries.entry((addr, ifindex));
        match entry {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let was_reachable = e.get().state == NeighborState::Reachable;
                *e.get_mut() = NeighborEntry {
                    state: NeighborState::Reachable,
                    last_seen: now,
                };
                !was_reachable
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(NeighborEntry {
                    state: NeighborState::Reachable,
                    last_seen: now,
                });
                true
            }
        }
    }

    /// Record an outstanding probe, without overwriting confirmed state.
    pub fn probe(&mut self, addr: Ipv6Addr, ifindex: u32, now: Instant) {
        self.entries
            .entry((addr, ifindex))
            .or_insert(NeighborEntry {
                state: NeighborState::Tentative,
                last_seen: now,
            });
    }

    /// Interface on which `addr` is known (tentative entries do not count),
    /// excluding the given interface.
    pub fn lookup_other(&self, addr: Ipv6Addr, exclude_ifindex: u32) -> Option<u32> {
        self.entries
            .iter()
            .find(|((a, i), e)| {
                *a == addr && *i != exclude_ifindex && e.state != NeighborState::Tentative
            })
            .map(|((_, i), _)| *i)
    }

    pub fn state(&self, addr: Ipv6Addr, ifindex: u32) -> Option<NeighborState> {
        self.entries.get(&(addr, ifindex)).map(|e| e.state)
    }

    /// Age entries: tentative probes expire, reachable degrades to stale,
    /// stale entries are evicted.
    pub fn sweep(&mut self, now: Instant) {
        for entry in self.entries.values_mut() {
            if entry.state == NeighborState::Reachable
                && now.duration_since(entry.last_seen) > REACHABLE_TIMEOUT
            {
                entry.state = NeighborState::Stale;
            }
        }
        self.entries.retain(|_, entry| {
            let idle = now.duration_since(entry.last_seen);
            match entry.state {
                NeighborState::Tentative => idle <= TENTATIVE_TIMEOUT,
                NeighborState::Reachable => true,
                NeighborState::Stale => idle <= STALE_TIMEOUT,
            }
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A validated NS or NA, as read off the packet socket (payload starts at
/// the IPv6 header).
#[derive(Debug, PartialEq, Eq)]
pub struct NdMessage {
    pub msg_type: u8,
    pub src: Ipv6Addr,
    pub target: Ipv6Addr,
    pub flags: u8,
}

fn addr_at(data: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

/// Parse and validate a neighbor discovery message. RFC 4861 requires hop
/// limit 255 and ICMPv6 code 0; anything else is dropped.
pub fn parse_nd_message(data: &[u8]) -> Option<NdMessage> {
    if data.len() < IPV6_HEADER_LEN + ND_MESSAGE_LEN {
        return None;
    }
    if data[6] != 58 || data[7] != 255 {
        return None;
    }
    let msg_type = data[IPV6_HEADER_LEN];
    if msg_type != ND_NEIGHBOR_SOLICIT && msg_type != ND_NEIGHBOR_ADVERT {
        return None;
    }
    if data[IPV6_HEADER_LEN + 1] != 0 {
        return None;
    }
    Some(NdMessage {
        msg_type,
        src: addr_at(data, 8),
        target: addr_at(data, IPV6_HEADER_LEN + 8),
        flags: data[IPV6_HEADER_LEN + 4],
    })
}

/// ff02::1:ffXX:XXXX for the given address.
pub fn solicited_node_multicast(addr: &Ipv6Addr) -> Ipv6Addr {
    let octets = addr.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        1,
        0xff00 | octets[13] as u16,
        ((octets[14] as u16) << 8) | octets[15] as u16,
    )
}

/// Proxied advertisement: solicited + override, router flag cleared, our
/// link-layer address as the target option.
pub fn build_neighbor_advert(target: Ipv6Addr, mac: &[u8; 6]) -> Vec<u8> {
    let mut w = crate::engines::PacketWriter::with_capacity(ND_MESSAGE_LEN + 8);
    w.u8(ND_NEIGHBOR_ADVERT).u8(0).u16(0);
    w.u8(NA_FLAG_SOLICITED | NA_FLAG_OVERRIDE).bytes(&[0, 0, 0]);
    w.addr(target);
    w.u8(ND_OPT_TARGET_LINKADDR).u8(1).bytes(mac);
    w.into_vec()
}

/// Proxied solicitation carrying our link-layer address.
pub fn build_neighbor_solicit(target: Ipv6Addr, mac: &[u8; 6]) -> Vec<u8> {
    let mut w = crate::engines::PacketWriter::with_capacity(ND_MESSAGE_LEN + 8);
    w.u8(ND_NEIGHBOR_SOLICIT).u8(0).u16(0);
    w.u32(0);
    w.addr(target);
    w.u8(ND_OPT_SOURCE_LINKADDR).u8(1).bytes(mac);
    w.into_vec()
}

/// The engine: packet socket for ingress, raw ICMPv6 socket for egress,
/// learned neighbor table, periodic maintenance.
pub struct NdpProxy {
    config: Rc<RelaydConfig>,
    registry: Rc<InterfaceRegistry>,
    logger: Logger,
    packet_sock: Rc<OwnedFd>,
    icmp_sock: Rc<OwnedFd>,
    neighbors: NeighborTable,
    maintenance: Rc<MonotonicTimer>,
}

impl NdpProxy {
    /// Open sockets, enable proxy_ndp and register with the multiplexer.
    /// Returns None when NDP proxying is not enabled.
    pub fn init(
        config: Rc<RelaydConfig>,
        registry: Rc<InterfaceRegistry>,
        evloop: &mut EventLoop,
        logger: Logger,
    ) -> Result<Option<Rc<RefCell<Self>>>> {
        if !config.ndp_relay {
            return Ok(None);
        }

        for iface in registry.all() {
            if let Err(e) = sysctl::sysctl_interface(&iface.name, "proxy_ndp", "1") {
                logger.warning(Facility::NdpProxy, &format!("{:#}", e));
            }
        }

        let packet_sock = Rc::new(
            sockets::create_ndp_packet_socket().context("Failed to open ND packet socket")?,
        );
        // Block-all filter: this socket only ever sends.
        let icmp_sock =
            Rc::new(sockets::create_icmpv6_socket(&[]).context("Failed to open ND send socket")?);

        let maintenance = Rc::new(MonotonicTimer::new()?);

        let this = Rc::new(RefCell::new(Self {
            config,
            registry,
            logger,
            packet_sock,
            icmp_sock,
            neighbors: NeighborTable::new(),
            maintenance: maintenance.clone(),
        }));

        let handle = this.clone();
        evloop.register_timer(maintenance.clone(), Box::new(move || handle.borrow_mut().maintain()))?;
        maintenance.arm(MAINTENANCE_INTERVAL)?;

        let handle = this.clone();
        let sock = this.borrow().packet_sock.clone();
        evloop.register_datagram(
            sock,
            Box::new(move |source, data, iface| {
                handle.borrow_mut().handle_packet(source, data, iface)
            }),
        )?;

        Ok(Some(this))
    }

    /// Undo the proxy_ndp toggles.
    pub fn shutdown(&self) {
        for iface in self.registry.all() {
            if let Err(e) = sysctl::sysctl_interface(&iface.name, "proxy_ndp", "0") {
                self.logger.warning(Facility::NdpProxy, &format!("{:#}", e));
            }
        }
    }

    fn handle_packet(&mut self, _source: &RecvSource, data: &[u8], iface: &Interface) {
        let Some(message) = parse_nd_message(data) else {
            return;
        };
        match message.msg_type {
            ND_NEIGHBOR_SOLICIT => self.handle_solicit(&message, iface),
            ND_NEIGHBOR_ADVERT => self.handle_advert(&message, iface),
            _ => {}
        }
    }

    fn handle_solicit(&mut self, message: &NdMessage, iface: &Interface) {
        let now = Instant::now();

        // DAD probes (unspecified source) are replicated on every other link
        if message.src.is_unspecified() {
            let registry = self.registry.clone();
            for other in registry.all().filter(|other| other.index != iface.index) {
                self.send_neighbor_solicit(other, message.target);
            }
            return;
        }

        // The soliciting host just proved its own reachability
        if !iface.external {
            self.note_reachable(message.src, iface, now);
        }

        if let Some(_other_ifindex) = self.neighbors.lookup_other(message.target, iface.index) {
            self.logger.info(
                Facility::NdpProxy,
                &format!(
                    "Proxying advertisement for {} towards {}",
                    message.target, iface.name
                ),
            );
            self.send_neighbor_advert(iface, message.target, message.src);
        } else {
            let registry = self.registry.clone();
            for other in registry
                .all()
                .filter(|other| other.index != iface.index && !other.external)
            {
                self.neighbors.probe(message.target, other.index, now);
                self.send_neighbor_solicit(other, message.target);
            }
        }
    }

    fn handle_advert(&mut self, message: &NdMessage, iface: &Interface) {
        // Hosts on external slaves are not proxied
        if iface.external {
            return;
        }
        self.note_reachable(message.target, iface, Instant::now());
    }

    fn note_reachable(&mut self, addr: Ipv6Addr, iface: &Interface, now: Instant) {
        let newly_reachable = self.neighbors.learn(addr, iface.index, now);

        if newly_reachable && self.config.route_learning && !iface.is_master() {
            match netlink::add_host_route(addr, iface.index) {
                Ok(()) => self.logger.info(
                    Facility::NdpProxy,
                    &format!("Learned route to {} via {}", addr, iface.name),
                ),
                Err(e) => self
                    .logger
                    .warning(Facility::NdpProxy, &format!("{:#}", e)),
            }
        }
    }

    fn send_neighbor_advert(&self, iface: &Interface, target: Ipv6Addr, dest: Ipv6Addr) {
        let advert = build_neighbor_advert(target, &iface.mac);
        let dest = SocketAddrV6::new(dest, 0, 0, 0);
        let _ = forward::send_on(
            &self.logger,
            self.icmp_sock.as_raw_fd(),
            &dest,
            &[IoSlice::new(&advert)],
            iface,
        );
    }

    fn send_neighbor_solicit(&self, iface: &Interface, target: Ipv6Addr) {
        let solicit = build_neighbor_solicit(target, &iface.mac);
        let dest = SocketAddrV6::new(solicited_node_multicast(&target), 0, 0, 0);
        let _ = forward::send_on(
            &self.logger,
            self.icmp_sock.as_raw_fd(),
            &dest,
            &[IoSlice::new(&solicit)],
            iface,
        );
    }

    fn maintain(&mut self) {
        self.neighbors.sweep(Instant::now());
        let _ = self.maintenance.arm(MAINTENANCE_INTERVAL);
    }
}
