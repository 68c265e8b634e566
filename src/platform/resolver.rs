// SPDX-License-Identifier: Apache-2.0 OR MIT
//! System resolver configuration, as far as the daemon needs it: the first
//! search domain announced in DNS Search List options.

use std::fs::File;
use std::io::{BufRead, BufReader};

/// First search domain of the system resolver, if any.
pub fn first_search_domain() -> Option<String> {
    let file = File::open("/etc/resolv.conf").ok()?;
    first_search_domain_in(BufReader::new(file))
}

fn first_search_domain_in<R: BufRead>(reader: R) -> Option<String> {
    let mut domain_directive: Option<String> = None;

    for line in reader.lines() {
        let line = line.ok()?;
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("search") => {
                if let Some(first) = tokens.next() {
                    return Some(first.to_string());
                }
            }
            Some("domain") => {
                if domain_directive.is_none() {
                    domain_directive = tokens.next().map(str::to_string);
                }
            }
            _ => {}
        }
    }

    domain_directive
}
