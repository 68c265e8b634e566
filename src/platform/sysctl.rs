// SPDX-License-Identifier: Apache-2.0 OR MIT
//! IPv6 per-interface sysctl toggles.

use anyhow::{Context, Result};

/// Write an IPv6 sysctl option for an interface (or "all").
pub fn sysctl_interface(ifname: &str, option: &str, value: &str) -> Result<()> {
    let path = format!("/proc/sys/net/ipv6/conf/{}/{}", ifname, option);
    std::fs::write(&path, value).with_context(|| format!("Failed to write {}", path))
}
