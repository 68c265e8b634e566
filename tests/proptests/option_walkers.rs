// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Property-based tests: the option walkers and packet transformations must
//! survive any crafted input without panicking or reading out of bounds, and
//! the transparent-mode rewrite must stay invertible.

use proptest::prelude::*;
use relay6d::engines::dhcpv6::{
    build_server_response, parse_relay_reply, restore_broken_reply, rewrite_broken_client,
    scan_client_options, wrap_relay_forward, DhcpOptions, HOP_COUNT_LIMIT, MSG_RELAY_FORW,
    MSG_SOLICIT, OPT_CLIENTID,
};
use relay6d::engines::ndp::parse_nd_message;
use relay6d::engines::router::scan_advert;
use std::net::Ipv6Addr;

proptest! {
    /// The DHCPv6 option walker never reads past the declared end for any
    /// input, and every yielded option lies within bounds.
    #[test]
    fn dhcp_walker_stays_in_bounds(input in proptest::collection::vec(any::<u8>(), 0..2048)) {
        for option in DhcpOptions::new(&input, 0) {
            prop_assert!(option.offset + 4 + option.data.len() <= input.len());
        }
        // Walking from an offset must be just as safe
        for start in [1usize, 4, 33, 34] {
            for option in DhcpOptions::new(&input, start) {
                prop_assert!(option.offset >= start);
                prop_assert!(option.offset + 4 + option.data.len() <= input.len());
            }
        }
    }

    /// None of the packet-level entry points panic on arbitrary bytes.
    #[test]
    fn parsers_never_panic(input in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let _ = scan_advert(&input);
        let _ = parse_relay_reply(&input);
        let _ = scan_client_options(&input);
        let _ = parse_nd_message(&input);
        let _ = wrap_relay_forward(&input, Ipv6Addr::LOCALHOST, Ipv6Addr::LOCALHOST, 1);
        let _ = rewrite_broken_client(&input, 1, Ipv6Addr::LOCALHOST);
        let _ = restore_broken_reply(&input);
        let _ = build_server_response(&input, &[0; 6], Ipv6Addr::LOCALHOST);
    }

    /// Relay wrapping never exceeds the hop limit: hop_out <= hop_in + 1 <= 32.
    #[test]
    fn relay_forward_hop_invariant(hop in any::<u8>(), tail in proptest::collection::vec(any::<u8>(), 32..64)) {
        let mut message = vec![MSG_RELAY_FORW, hop];
        message.extend_from_slice(&tail);

        match wrap_relay_forward(&message, Ipv6Addr::LOCALHOST, Ipv6Addr::LOCALHOST, 1) {
            Some(wrapped) => {
                prop_assert!(hop < HOP_COUNT_LIMIT);
                prop_assert_eq!(wrapped[1], hop + 1);
                prop_assert!(wrapped[1] <= HOP_COUNT_LIMIT);
            }
            None => prop_assert!(hop >= HOP_COUNT_LIMIT),
        }
    }

    /// Transparent-mode rewrite followed by restore is the identity for any
    /// well-formed client message carrying a Client-ID and no Auth option.
    #[test]
    fn broken_rewrite_roundtrip(
        xid in proptest::array::uniform3(any::<u8>()),
        client_id in proptest::collection::vec(any::<u8>(), 1..64),
        ifindex in 1u32..1000,
        addr_bits in any::<u128>(),
    ) {
        let mut message = vec![MSG_SOLICIT, xid[0], xid[1], xid[2]];
        message.extend_from_slice(&OPT_CLIENTID.to_be_bytes());
        message.extend_from_slice(&(client_id.len() as u16).to_be_bytes());
        message.extend_from_slice(&client_id);

        let client = Ipv6Addr::from(addr_bits);
        let rewritten = rewrite_broken_client(&message, ifindex, client).unwrap();
        let (out_ifindex, out_client, restored) = restore_broken_reply(&rewritten).unwrap();

        prop_assert_eq!(out_ifindex, ifindex);
        prop_assert_eq!(out_client, client);
        prop_assert_eq!(restored, message);
    }
}
