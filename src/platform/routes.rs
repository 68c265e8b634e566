// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Kernel IPv6 routing table checks via `/proc/net/ipv6_route`.

use std::fs::File;
use std::io::{BufRead, BufReader};

const ZERO128: &str = "00000000000000000000000000000000";

/// Detect whether a default route exists.
///
/// Scans the kernel routing table for a `::/0` entry that is not on the
/// loopback interface.
pub fn have_default_route() -> bool {
    match File::open("/proc/net/ipv6_route") {
        Ok(file) => default_route_in(BufReader::new(file)),
        Err(_) => false,
    }
}

/// `/proc/net/ipv6_route` format, one route per line:
/// dst dst_len src src_len next_hop metric refcnt use flags ifname
fn default_route_in<R: BufRead>(reader: R) -> bool {
    for line in reader.lines() {
        let Ok(line) = line else {
            return false;
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        if fields[0] == ZERO128
            && fields[1] == "00"
            && fields[2] == ZERO128
            && fields[3] == "00"
            && fields[9] != "lo"
        {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_VIA_ETH0: &str = "00000000000000000000000000000000 00 \
        00000000000000000000000000000000 00 \
        fe800000000000000000000000000001 00000400 00000001 00000000 00000003     eth0\n";

    const DEFAULT_VIA_LO: &str = "00000000000000000000000000000000 00 \
        00000000000000000000000000000000 00 \
        00000000000000000000000000000000 ffffffff 00000001 00000000 00200200       lo\n";

    const PREFIX_ROUTE: &str = "20010db8000100000000000000000000 40 \
        00000000000000000000000000000000 00 \
        00000000000000000000000000000000 00000100 00000001 00000000 00000001     eth0\n";

    #[test]
    fn test_default_route_found() {
        let table = format!("{}{}", PREFIX_ROUTE, DEFAULT_VIA_ETH0);
        assert!(default_route_in(table.as_bytes()));
    }

    #[test]
    fn test_loopback_default_ignored() {
        assert!(!default_route_in(DEFAULT_VIA_LO.as_bytes()));
    }

    #[test]
    fn test_no_default_route() {
        assert!(!default_route_in(PREFIX_ROUTE.as_bytes()));
        assert!(!default_route_in("".as_bytes()));
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let table = format!("garbage\n{}short line\n", DEFAULT_VIA_ETH0);
        assert!(default_route_in(table.as_bytes()));
    }
}
