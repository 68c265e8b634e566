// SPDX-License-Identifier: Apache-2.0 OR MIT
//! DHCPv6 engine (RFC 3315): standards-compliant relay, a transparent mode
//! for servers that ignore relayed messages, and a stateless mini-server.
//!
//! Client messages from slaves are wrapped in RELAY-FORW envelopes toward the
//! master; RELAY-REPL responses are unwrapped and delivered to the recorded
//! peer. The transparent mode instead tags the Client-ID with a vendor DUID
//! prefix carrying the ingress interface and client address, so replies can
//! be routed without server-side relay support.

use crate::config::RelaydConfig;
use crate::engines::{PacketWriter, ALL_DHCPV6_RELAYS, ALL_DHCPV6_SERVERS};
use crate::logging::{Facility, Logger};
use crate::mux::{EventLoop, RecvSource};
use crate::platform::interface::{Interface, InterfaceRegistry};
use crate::platform::{addrs, forward, sockets};
use crate::RELAYD_BUFFER_SIZE;
use anyhow::{Context, Result};
use std::cell::RefCell;
use std::io::IoSlice;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::ops::Range;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;

pub const DHCPV6_SERVER_PORT: u16 = 547;
pub const DHCPV6_CLIENT_PORT: u16 = 546;

pub const MSG_SOLICIT: u8 = 1;
pub const MSG_ADVERTISE: u8 = 2;
pub const MSG_REQUEST: u8 = 3;
pub const MSG_REBIND: u8 = 6;
pub const MSG_REPLY: u8 = 7;
pub const MSG_RECONFIGURE: u8 = 10;
pub const MSG_INFORMATION_REQUEST: u8 = 11;
pub const MSG_RELAY_FORW: u8 = 12;
pub const MSG_RELAY_REPL: u8 = 13;

pub const OPT_CLIENTID: u16 = 1;
pub const OPT_SERVERID: u16 = 2;
pub const OPT_IA_NA: u16 = 3;
pub const OPT_RELAY_MSG: u16 = 9;
pub const OPT_AUTH: u16 = 11;
pub const OPT_STATUS: u16 = 13;
pub const OPT_INTERFACE_ID: u16 = 18;
pub const OPT_DNS_SERVERS: u16 = 23;

pub const STATUS_NOADDRSAVAIL: u16 = 2;

/// RFC 3315 relay hop limit
pub const HOP_COUNT_LIMIT: u8 = 32;

const DUID_VENDOR: u16 = 2;
const DUID_LL: u16 = 3;
const HARDWARE_TYPE_ETHERNET: u16 = 1;

/// Private enterprise number carried in transparent-mode DUID prefixes
const ENTERPRISE_NUMBER: u32 = 30462;
const BROKEN_DUID_SUBTYPE: u16 = 1;

/// duid type (2) + enterprise (4) + subtype (2) + ifindex (4) + address (16)
pub const BROKEN_DUID_LEN: usize = 28;

pub const CLIENT_HEADER_LEN: usize = 4;
/// type (1) + hop count (1) + link address (16) + peer address (16)
pub const RELAY_HEADER_LEN: usize = 34;

const MAX_CLIENT_ID_LEN: usize = 130;
pub const SERVER_DUID_LEN: usize = 10;

/// One parsed option: code, absolute offset of the option header, value bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct DhcpOption<'a> {
    pub code: u16,
    pub offset: usize,
    pub data: &'a [u8],
}

/// TLV walker over `(type:u16, length:u16, value)` options, big-endian.
///
/// Iteration ends when fewer than four bytes remain or a declared length
/// would run past the packet end; truncation is not an error, the walk just
/// stops. A zero-length option is yielded and advances by four bytes.
pub struct DhcpOptions<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DhcpOptions<'a> {
    pub fn new(data: &'a [u8], start: usize) -> Self {
        Self { data, pos: start }
    }
}

impl<'a> Iterator for DhcpOptions<'a> {
    type Item = DhcpOption<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + 4 > self.data.len() {
            return None;
        }
        let code = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        let length = u16::from_be_bytes([self.data[self.pos + 2], self.data[self.pos + 3]]) as usize;
        if self.pos + 4 + length > self.data.len() {
            return None;
        }
        let option = DhcpOption {
            code,
            offset: self.pos,
            data: &self.data[self.pos + 4..self.pos + 4 + length],
        };
        self.pos += 4 + length;
        Some(option)
    }
}

/// Message types a client must never originate.
pub fn client_message_blocked(msg_type: u8) -> bool {
    matches!(
        msg_type,
        MSG_RELAY_REPL | MSG_RECONFIGURE | MSG_REPLY | MSG_ADVERTISE
    )
}

fn is_unicast_link_local(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

fn addr_at(data: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

/// Wrap a client message in a RELAY-FORW envelope.
///
/// An already-relayed message gets its hop count incremented; at the RFC
/// limit of 32 the message is dropped. The Interface-ID option carries the
/// raw 4-byte ingress interface index (opaque to the server, decoded by us
/// on the return path).
pub fn wrap_relay_forward(
    payload: &[u8],
    peer: Ipv6Addr,
    link_address: Ipv6Addr,
    ifindex: u32,
) -> Option<Vec<u8>> {
    if payload.len() < CLIENT_HEADER_LEN {
        return None;
    }
    let hop_count = if payload[0] == MSG_RELAY_FORW {
        if payload[1] >= HOP_COUNT_LIMIT {
            return None;
        }
        payload[1] + 1
    } else {
        0
    };

    let mut w = PacketWriter::with_capacity(RELAY_HEADER_LEN + 12 + payload.len());
    w.u8(MSG_RELAY_FORW).u8(hop_count).addr(link_address).addr(peer);
    w.u16(OPT_INTERFACE_ID).u16(4).bytes(&ifindex.to_ne_bytes());
    w.u16(OPT_RELAY_MSG).u16(payload.len() as u16).bytes(payload);
    Some(w.into_vec())
}

/// What a RELAY-REPL envelope yields for the return path.
#[derive(Debug, PartialEq, Eq)]
pub struct RelayReply {
    pub peer: Ipv6Addr,
    pub ifindex: Option<u32>,
    pub payload: Option<Range<usize>>,
}

/// Parse the top-level RELAY-REPL envelope of a server response.
pub fn parse_relay_reply(data: &[u8]) -> Option<RelayReply> {
    if data.len() < RELAY_HEADER_LEN || data[0] != MSG_RELAY_REPL {
        return None;
    }
    let mut reply = RelayReply {
        peer: addr_at(data, 18),
        ifindex: None,
        payload: None,
    };
    for option in DhcpOptions::new(data, RELAY_HEADER_LEN) {
        match option.code {
            OPT_INTERFACE_ID if option.data.len() == 4 => {
                reply.ifindex = Some(u32::from_ne_bytes(option.data.try_into().ok()?));
            }
            OPT_RELAY_MSG => {
                reply.payload = Some(option.offset + 4..option.offset + 4 + option.data.len());
            }
            _ => {}
        }
    }
    Some(reply)
}

/// DNS server slots and authentication state of a client-visible message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DnsScan {
    /// (value offset of the first address, number of addresses)
    pub dns: Option<(usize, usize)>,
    pub authenticated: bool,
}

pub fn scan_client_options(payload: &[u8]) -> DnsScan {
    let mut scan = DnsScan::default();
    for option in DhcpOptions::new(payload, CLIENT_HEADER_LEN) {
        match option.code {
            OPT_DNS_SERVERS if option.data.len() >= 16 => {
                scan.dns = Some((option.offset + 4, option.data.len() / 16));
            }
            OPT_AUTH => scan.authenticated = true,
            _ => {}
        }
    }
    scan
}

fn encode_broken_duid(ifindex: u32, client: Ipv6Addr) -> [u8; BROKEN_DUID_LEN] {
    let mut w = PacketWriter::with_capacity(BROKEN_DUID_LEN);
    w.u16(DUID_VENDOR)
        .u32(ENTERPRISE_NUMBER)
        .u16(BROKEN_DUID_SUBTYPE)
        .bytes(&ifindex.to_ne_bytes())
        .addr(client);
    w.into_vec().try_into().expect("fixed duid layout")
}

/// Transparent mode, client direction: prepend the routing prefix to the
/// Client-ID. Refused (None) for messages carrying an Authentication option
/// or no Client-ID at all.
pub fn rewrite_broken_client(data: &[u8], ifindex: u32, client: Ipv6Addr) -> Option<Vec<u8>> {
    if data.len() < CLIENT_HEADER_LEN {
        return None;
    }

    let mut client_id: Option<DhcpOption> = None;
    for option in DhcpOptions::new(data, CLIENT_HEADER_LEN) {
        if option.code == OPT_AUTH {
            return None;
        }
        if option.code == OPT_CLIENTID && client_id.is_none() {
            client_id = Some(option);
        }
    }
    let client_id = client_id?;
    let value_offset = client_id.offset + 4;
    let new_length = (client_id.data.len() + BROKEN_DUID_LEN) as u16;

    let mut out = Vec::with_capacity(data.len() + BROKEN_DUID_LEN);
    out.extend_from_slice(&data[..value_offset]);
    out.extend_from_slice(&encode_broken_duid(ifindex, client));
    out.extend_from_slice(&data[value_offset..]);
    out[client_id.offset + 2..value_offset].copy_from_slice(&new_length.to_be_bytes());
    Some(out)
}

/// Transparent mode, server direction: detect our prefix, recover the slave
/// index and client address, and strip the prefix again.
pub fn restore_broken_reply(data: &[u8]) -> Option<(u32, Ipv6Addr, Vec<u8>)> {
    if data.len() < CLIENT_HEADER_LEN {
        return None;
    }

    let mut tagged: Option<DhcpOption> = None;
    for option in DhcpOptions::new(data, CLIENT_HEADER_LEN) {
        if option.code == OPT_AUTH {
            return None;
        }
        if option.code != OPT_CLIENTID
            || option.data.len() <= BROKEN_DUID_LEN
            || option.data.len() > MAX_CLIENT_ID_LEN
        {
            continue;
        }
        let value = option.data;
        if u16::from_be_bytes([value[0], value[1]]) == DUID_VENDOR
            && u32::from_be_bytes([value[2], value[3], value[4], value[5]]) == ENTERPRISE_NUMBER
            && u16::from_be_bytes([value[6], value[7]]) == BROKEN_DUID_SUBTYPE
        {
            tagged = Some(option);
            break;
        }
    }
    let tagged = tagged?;

    let value = tagged.data;
    let ifindex = u32::from_ne_bytes([value[8], value[9], value[10], value[11]]);
    let client = addr_at(value, 12);

    let value_offset = tagged.offset + 4;
    let new_length = (tagged.data.len() - BROKEN_DUID_LEN) as u16;
    let mut out = Vec::with_capacity(data.len() - BROKEN_DUID_LEN);
    out.extend_from_slice(&data[..value_offset]);
    out.extend_from_slice(&data[value_offset + BROKEN_DUID_LEN..]);
    out[tagged.offset + 2..value_offset].copy_from_slice(&new_length.to_be_bytes());
    Some((ifindex, client, out))
}

/// Our 10-byte link-layer server DUID (type 3, ethernet, interface MAC).
pub fn server_duid(mac: &[u8; 6]) -> [u8; SERVER_DUID_LEN] {
    let mut w = PacketWriter::with_capacity(SERVER_DUID_LEN);
    w.u16(DUID_LL).u16(HARDWARE_TYPE_ETHERNET).bytes(mac);
    w.into_vec().try_into().expect("fixed duid layout")
}

/// Walk nested RELAY-FORW envelopes down to the innermost client message.
/// Returns (offset, length) of that message within `data`.
fn innermost_client_message(data: &[u8], start: usize, len: usize) -> Option<(usize, usize)> {
    if len < CLIENT_HEADER_LEN {
        return None;
    }
    if data[start] != MSG_RELAY_FORW {
        return Some((start, len));
    }
    if len < RELAY_HEADER_LEN {
        return None;
    }
    for option in DhcpOptions::new(&data[..start + len], start + RELAY_HEADER_LEN) {
        if option.code == OPT_RELAY_MSG {
            return innermost_client_message(data, option.offset + 4, option.data.len());
        }
    }
    None
}

/// Build the reply for one (unwrapped) client message. None means "do not
/// answer": REBIND, or a Server-ID that is not ours.
fn build_reply_message(inner: &[u8], mac: &[u8; 6], dns: Ipv6Addr) -> Option<Vec<u8>> {
    if inner.len() < CLIENT_HEADER_LEN {
        return None;
    }
    let msg_type = match inner[0] {
        MSG_SOLICIT => MSG_ADVERTISE,
        MSG_REBIND => return None,
        _ => MSG_REPLY,
    };

    let our_duid = server_duid(mac);
    let mut client_id: Option<&[u8]> = None;
    let mut requested_ia_na = false;

    for option in DhcpOptions::new(inner, CLIENT_HEADER_LEN) {
        match option.code {
            OPT_CLIENTID if option.data.len() <= MAX_CLIENT_ID_LEN => {
                client_id = Some(option.data);
            }
            OPT_SERVERID => {
                if option.data != our_duid {
                    return None;
                }
            }
            OPT_IA_NA => requested_ia_na = true,
            _ => {}
        }
    }

    let mut w = PacketWriter::with_capacity(64 + MAX_CLIENT_ID_LEN);
    w.u8(msg_type).bytes(&inner[1..4]);
    w.u16(OPT_DNS_SERVERS).u16(16).addr(dns);
    w.u16(OPT_SERVERID).u16(SERVER_DUID_LEN as u16).bytes(&our_duid);
    if let Some(id) = client_id {
        w.u16(OPT_CLIENTID).u16(id.len() as u16).bytes(id);
    }
    if requested_ia_na {
        w.u16(OPT_STATUS).u16(2).u16(STATUS_NOADDRSAVAIL);
    }
    Some(w.into_vec())
}

/// Rebuild the envelope chain around a reply: every RELAY-FORW becomes
/// RELAY-REPL and every Relay-Message length absorbs the size delta.
fn rebuild_relay_reply(data: &[u8], inner_start: usize, inner_len: usize, reply: &[u8]) -> Vec<u8> {
    let delta = reply.len() as i64 - inner_len as i64;
    let mut out = data.to_vec();

    let mut pos = 0usize;
    while pos < inner_start && out[pos] == MSG_RELAY_FORW {
        out[pos] = MSG_RELAY_REPL;
        let mut descend = None;
        for option in DhcpOptions::new(data, pos + RELAY_HEADER_LEN) {
            if option.code == OPT_RELAY_MSG {
                let new_length = (option.data.len() as i64 + delta) as u16;
                out[option.offset + 2..option.offset + 4]
                    .copy_from_slice(&new_length.to_be_bytes());
                descend = Some(option.offset + 4);
                break;
            }
        }
        match descend {
            Some(next) => pos = next,
            None => break,
        }
    }

    out.splice(inner_start..inner_start + inner_len, reply.iter().copied());
    out
}

/// Stateless mini-server: answer a request, possibly re-wrapping nested
/// relay envelopes around the reply.
pub fn build_server_response(data: &[u8], mac: &[u8; 6], dns: Ipv6Addr) -> Option<Vec<u8>> {
    if data.len() < CLIENT_HEADER_LEN {
        return None;
    }
    if data[0] == MSG_RELAY_FORW {
        let (inner_start, inner_len) = innermost_client_message(data, 0, data.len())?;
        let reply = build_reply_message(&data[inner_start..inner_start + inner_len], mac, dns)?;
        Some(rebuild_relay_reply(data, inner_start, inner_len, &reply))
    } else {
        build_reply_message(data, mac, dns)
    }
}

/// The engine: owns the port-547 socket and, in transparent mode, the
/// port-546 socket bound to the master.
pub struct Dhcpv6Relay {
    config: Rc<RelaydConfig>,
    registry: Rc<InterfaceRegistry>,
    logger: Logger,
    server_sock: Rc<OwnedFd>,
    broken_sock: Option<Rc<OwnedFd>>,
}

impl Dhcpv6Relay {
    /// Create sockets and register with the multiplexer. Returns None when
    /// DHCPv6 handling is not enabled or there are no slaves.
    pub fn init(
        config: Rc<RelaydConfig>,
        registry: Rc<InterfaceRegistry>,
        evloop: &mut EventLoop,
        logger: Logger,
    ) -> Result<Option<Rc<RefCell<Self>>>> {
        if !config.dhcpv6_relay || registry.slaves.is_empty() {
            return Ok(None);
        }

        let server_sock = Rc::new(
            sockets::create_dhcpv6_socket(DHCPV6_SERVER_PORT)
                .context("Failed to open DHCPv6 server socket")?,
        );
        for slave in &registry.slaves {
            sockets::join_ipv6_multicast(
                server_sock.as_raw_fd(),
                ALL_DHCPV6_RELAYS,
                slave.index,
            )?;
        }

        let broken_sock = if config.compat_broken_dhcpv6 {
            let sock = sockets::create_dhcpv6_socket(DHCPV6_CLIENT_PORT)
                .context("Failed to open DHCPv6 client socket")?;
            sockets::bind_to_device(sock.as_raw_fd(), &registry.master.name)?;
            Some(Rc::new(sock))
        } else {
            None
        };

        let this = Rc::new(RefCell::new(Self {
            config,
            registry,
            logger,
            server_sock,
            broken_sock,
        }));

        let handle = this.clone();
        let sock = this.borrow().server_sock.clone();
        evloop.register_datagram(
            sock,
            Box::new(move |source, data, iface| {
                handle.borrow_mut().handle_dhcpv6(source, data, iface)
            }),
        )?;

        if let Some(broken) = this.borrow().broken_sock.clone() {
            let handle = this.clone();
            evloop.register_datagram(
                broken,
                Box::new(move |source, data, iface| {
                    handle.borrow_mut().handle_dhcpv6(source, data, iface)
                }),
            )?;
        }

        Ok(Some(this))
    }

    fn handle_dhcpv6(&mut self, source: &RecvSource, data: &[u8], iface: &Interface) {
        if data.len() < CLIENT_HEADER_LEN {
            return;
        }
        let Some(peer) = source.udp().copied() else {
            return;
        };

        if iface.is_master() {
            self.relay_server_response(data);
        } else if self.config.dhcpv6_server {
            self.handle_client_request(&peer, data, iface);
        } else if self.config.compat_broken_dhcpv6 {
            self.relay_client_request_broken(&peer, data, iface);
        } else {
            self.relay_client_request(&peer, data, iface);
        }
    }

    /// Standard relay, client direction.
    fn relay_client_request(&self, peer: &SocketAddrV6, data: &[u8], iface: &Interface) {
        if client_message_blocked(data[0]) {
            return;
        }
        self.logger.notice(Facility::Dhcpv6, "Got a DHCPv6-request");

        // The slave may not be configured yet (hen-and-egg during cold
        // start); the master's address is a tolerated RFC deviation.
        let link_address = addrs::interface_address(&iface.name, false).or_else(|| {
            self.logger.warning(
                Facility::Dhcpv6,
                &format!("failed to detect suitable source address for {}", iface.name),
            );
            addrs::interface_address(&self.registry.master.name, false)
        });
        let Some(link_address) = link_address else {
            return;
        };

        let Some(packet) = wrap_relay_forward(data, *peer.ip(), link_address, iface.index) else {
            return;
        };

        let dest = SocketAddrV6::new(ALL_DHCPV6_SERVERS, DHCPV6_SERVER_PORT, 0, 0);
        let _ = forward::send_on(
            &self.logger,
            self.server_sock.as_raw_fd(),
            &dest,
            &[IoSlice::new(&packet)],
            &self.registry.master,
        );
    }

    /// Transparent relay, client direction.
    fn relay_client_request_broken(&self, peer: &SocketAddrV6, data: &[u8], iface: &Interface) {
        if client_message_blocked(data[0]) {
            return;
        }
        if data.len() + BROKEN_DUID_LEN > RELAYD_BUFFER_SIZE {
            return;
        }
        self.logger.notice(Facility::Dhcpv6, "Got a DHCPv6-request");

        let Some(packet) = rewrite_broken_client(data, iface.index, *peer.ip()) else {
            return;
        };
        let Some(broken_sock) = &self.broken_sock else {
            return;
        };

        let dest = SocketAddrV6::new(
            ALL_DHCPV6_RELAYS,
            DHCPV6_SERVER_PORT,
            0,
            self.registry.master.index,
        );
        let _ = forward::send_on(
            &self.logger,
            broken_sock.as_raw_fd(),
            &dest,
            &[IoSlice::new(&packet)],
            &self.registry.master,
        );
    }

    /// Server direction, both modes: recover the slave and client, rewrite
    /// DNS servers if needed, deliver.
    fn relay_server_response(&self, data: &[u8]) {
        self.logger.notice(Facility::Dhcpv6, "Got a DHCPv6-reply");

        let (ifindex, target_ip, mut port, mut payload) = if !self.config.compat_broken_dhcpv6 {
            let Some(reply) = parse_relay_reply(data) else {
                return;
            };
            let Some(ifindex) = reply.ifindex else {
                return;
            };
            let Some(range) = reply.payload else {
                return;
            };
            (
                ifindex,
                reply.peer,
                DHCPV6_CLIENT_PORT,
                data[range].to_vec(),
            )
        } else {
            let Some((ifindex, client, payload)) = restore_broken_reply(data) else {
                return;
            };
            (ifindex, client, DHCPV6_CLIENT_PORT, payload)
        };

        let Some(slave) = self.registry.slaves.iter().find(|s| s.index == ifindex) else {
            return;
        };
        if payload.len() < CLIENT_HEADER_LEN {
            return;
        }

        if payload[0] == MSG_RELAY_REPL {
            // Relay chain continues: hand the envelope to the next relay
            port = DHCPV6_SERVER_PORT;
        } else {
            let scan = scan_client_options(&payload);
            if let Some((offset, count)) = scan.dns {
                let mut rewrite = self.config.always_rewrite_dns;
                for i in 0..count {
                    if is_unicast_link_local(&addr_at(&payload, offset + 16 * i)) {
                        rewrite = true;
                    }
                }
                if rewrite {
                    if scan.authenticated {
                        return; // Impossible to rewrite
                    }
                    let Some(rewrite_addr) = addrs::interface_address(&slave.name, true) else {
                        return;
                    };
                    for i in 0..count {
                        let at = offset + 16 * i;
                        payload[at..at + 16].copy_from_slice(&rewrite_addr.octets());
                    }
                }
            }
        }

        let dest = SocketAddrV6::new(target_ip, port, 0, 0);
        let _ = forward::send_on(
            &self.logger,
            self.server_sock.as_raw_fd(),
            &dest,
            &[IoSlice::new(&payload)],
            slave,
        );
    }

    /// Stateless mini-server for slave requests.
    fn handle_client_request(&self, peer: &SocketAddrV6, data: &[u8], iface: &Interface) {
        self.logger.notice(Facility::Dhcpv6, "Got DHCPv6 request");

        let Some(dns) = addrs::interface_address_preferring_global(&iface.name) else {
            return;
        };
        let Some(reply) = build_server_response(data, &iface.mac, dns) else {
            return;
        };

        let _ = forward::send_on(
            &self.logger,
            self.server_sock.as_raw_fd(),
            peer,
            &[IoSlice::new(&reply)],
            iface,
        );
    }
}
