// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Command line definition and the immutable runtime configuration snapshot.
//!
//! The configuration is assembled once from the parsed arguments and then
//! shared read-only with every engine. Nothing mutates it after startup.

use clap::{Parser, ValueEnum};
use std::net::Ipv6Addr;
use std::path::PathBuf;
use thiserror::Error;

/// Router Discovery operating mode for `-R`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RdMode {
    /// Relay RA/RS between master and slaves
    Relay,
    /// Mini-server announcing local addresses on slaves
    Server,
}

/// DHCPv6 operating mode for `-D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Dhcpv6Mode {
    /// Standards-compliant relay
    Relay,
    /// Transparent relay for broken servers
    Transparent,
    /// Mini-server for stateless DHCPv6 on slaves
    Server,
}

#[derive(Parser, Debug, PartialEq)]
#[command(
    name = "relay6d",
    about = "IPv6 relay daemon: RD relay/server, DHCPv6 relay/server, NDP proxy",
    after_help = "Note: to use server features only (no relaying) set master to lo.\n\
                  Prefix a slave with ~ to serve only DAD and router traffic on it."
)]
pub struct Args {
    /// Automatic relay bundle (RD relay, DHCPv6 relay, NDP, forwarding,
    /// initial RS, route learning, forced address assignment)
    #[arg(short = 'A')]
    pub auto_relay: bool,

    /// Automatic server bundle (RD server, DHCPv6 server)
    #[arg(short = 'S')]
    pub auto_server: bool,

    /// Enable Router Discovery support
    #[arg(short = 'R', value_enum, value_name = "mode")]
    pub router_discovery: Option<RdMode>,

    /// Enable DHCPv6 support
    #[arg(short = 'D', value_enum, value_name = "mode")]
    pub dhcpv6: Option<Dhcpv6Mode>,

    /// Enable Neighbor Discovery Proxy
    #[arg(short = 'N')]
    pub ndp: bool,

    /// Enable forwarding for interfaces
    #[arg(short = 'F')]
    pub forwarding: bool,

    /// Send initial Router Solicitation to the master
    #[arg(short = 's')]
    pub send_solicitation: bool,

    /// RD: force local address assignment (accept_ra=2 on slaves)
    #[arg(short = 'l')]
    pub force_address: bool,

    /// RD/DHCPv6: always rewrite name server addresses
    #[arg(short = 'n')]
    pub rewrite_dns: bool,

    /// NDP: learn routes to neighbors
    #[arg(short = 'r')]
    pub route_learning: bool,

    /// Pidfile location
    #[arg(short = 'p', value_name = "pidfile", default_value = "/var/run/relay6d.pid")]
    pub pidfile: PathBuf,

    /// Daemonize
    #[arg(short = 'd')]
    pub daemonize: bool,

    /// Increase logging verbosity (repeatable)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Uplink interface facing the ISP
    pub master: String,

    /// Downstream interfaces; prefix with ~ to mark external
    pub slaves: Vec<String>,
}

/// Feature flags shared read-only by all engines. Assembled once at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelaydConfig {
    pub rd_relay: bool,
    pub rd_server: bool,
    pub dhcpv6_relay: bool,
    pub dhcpv6_server: bool,
    pub compat_broken_dhcpv6: bool,
    pub ndp_relay: bool,
    pub route_learning: bool,
    pub enable_forwarding: bool,
    pub send_router_solicitation: bool,
    pub force_address_assignment: bool,
    pub always_rewrite_dns: bool,

    /// Announce a default router even with no public prefix available.
    pub always_announce_default_router: bool,
    /// Deprecate ULA prefixes in synthesized RAs when a public prefix exists.
    pub deprecate_ula_if_public: bool,
    /// Name server handed out instead of a detected interface address.
    pub dns_address: Option<Ipv6Addr>,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("No relays enabled or no slave interfaces specified")]
    NothingEnabled,
}

impl RelaydConfig {
    /// Expand bundles and individual flags into the snapshot.
    pub fn from_args(args: &Args) -> Self {
        let mut config = RelaydConfig::default();

        if args.auto_relay {
            config.rd_relay = true;
            config.dhcpv6_relay = true;
            config.ndp_relay = true;
            config.enable_forwarding = true;
            config.send_router_solicitation = true;
            config.route_learning = true;
            config.force_address_assignment = true;
        }

        if args.auto_server {
            config.rd_relay = true;
            config.rd_server = true;
            config.dhcpv6_relay = true;
            config.dhcpv6_server = true;
        }

        if let Some(mode) = args.router_discovery {
            config.rd_relay = true;
            if mode == RdMode::Server {
                config.rd_server = true;
            }
        }

        if let Some(mode) = args.dhcpv6 {
            config.dhcpv6_relay = true;
            match mode {
                Dhcpv6Mode::Relay => {}
                Dhcpv6Mode::Transparent => config.compat_broken_dhcpv6 = true,
                Dhcpv6Mode::Server => config.dhcpv6_server = true,
            }
        }

        config.ndp_relay |= args.ndp;
        config.enable_forwarding |= args.forwarding;
        config.send_router_solicitation |= args.send_solicitation;
        config.force_address_assignment |= args.force_address;
        config.always_rewrite_dns |= args.rewrite_dns;
        config.route_learning |= args.route_learning;

        config
    }

    /// At least one engine must end up with an event source, or the daemon
    /// would sit in an empty loop forever. The NDP proxy listens on all
    /// interfaces; router discovery and DHCPv6 only serve slaves.
    pub fn validate(&self, slave_count: usize) -> Result<(), ConfigError> {
        let any_source = self.ndp_relay
            || (slave_count > 0 && (self.rd_relay || self.rd_server || self.dhcpv6_relay));
        if !any_source {
            return Err(ConfigError::NothingEnabled);
        }
        Ok(())
    }
}

/// Split a slave argument into its interface name and the external marker.
pub fn parse_slave_spec(spec: &str) -> (&str, bool) {
    match spec.strip_prefix('~') {
        Some(name) => (name, true),
        None => (spec, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).expect("argument parsing failed")
    }

    #[test]
    fn test_auto_relay_bundle() {
        let args = parse(&["relay6d", "-A", "eth0", "lan0"]);
        let config = RelaydConfig::from_args(&args);

        assert!(config.rd_relay);
        assert!(!config.rd_server);
        assert!(config.dhcpv6_relay);
        assert!(config.ndp_relay);
        assert!(config.enable_forwarding);
        assert!(config.send_router_solicitation);
        assert!(config.route_learning);
        assert!(config.force_address_assignment);
    }

    #[test]
    fn test_auto_server_bundle() {
        let args = parse(&["relay6d", "-S", "lo", "lan0"]);
        let config = RelaydConfig::from_args(&args);

        assert!(config.rd_relay);
        assert!(config.rd_server);
        assert!(config.dhcpv6_relay);
        assert!(config.dhcpv6_server);
        assert!(!config.ndp_relay);
        assert!(!config.enable_forwarding);
    }

    #[test]
    fn test_explicit_modes() {
        let args = parse(&["relay6d", "-R", "server", "-D", "transparent", "eth0", "lan0"]);
        let config = RelaydConfig::from_args(&args);

        assert!(config.rd_relay);
        assert!(config.rd_server);
        assert!(config.dhcpv6_relay);
        assert!(config.compat_broken_dhcpv6);
        assert!(!config.dhcpv6_server);
    }

    #[test]
    fn test_feature_options() {
        let args = parse(&["relay6d", "-R", "relay", "-s", "-l", "-n", "-r", "eth0", "lan0"]);
        let config = RelaydConfig::from_args(&args);

        assert!(config.send_router_solicitation);
        assert!(config.force_address_assignment);
        assert!(config.always_rewrite_dns);
        assert!(config.route_learning);
    }

    #[test]
    fn test_rejects_unknown_mode() {
        assert!(Args::try_parse_from(["relay6d", "-R", "bogus", "eth0"]).is_err());
        assert!(Args::try_parse_from(["relay6d", "-D", "bogus", "eth0"]).is_err());
    }

    #[test]
    fn test_requires_master() {
        assert!(Args::try_parse_from(["relay6d", "-A"]).is_err());
    }

    #[test]
    fn test_verbosity_count() {
        let args = parse(&["relay6d", "-N", "-v", "-v", "eth0"]);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_validate_nothing_enabled() {
        let args = parse(&["relay6d", "eth0", "lan0"]);
        let config = RelaydConfig::from_args(&args);
        assert_eq!(config.validate(1), Err(ConfigError::NothingEnabled));

        let args = parse(&["relay6d", "-N", "eth0", "lan0"]);
        let config = RelaydConfig::from_args(&args);
        assert!(config.validate(1).is_ok());
    }

    #[test]
    fn test_validate_requires_slaves_for_relays() {
        // RD/DHCPv6 relays serve slaves; without any there is nothing to do
        let args = parse(&["relay6d", "-R", "relay", "-D", "relay", "eth0"]);
        let config = RelaydConfig::from_args(&args);
        assert_eq!(config.validate(0), Err(ConfigError::NothingEnabled));
        assert!(config.validate(2).is_ok());

        // The NDP proxy listens on the master too
        let args = parse(&["relay6d", "-N", "eth0"]);
        let config = RelaydConfig::from_args(&args);
        assert!(config.validate(0).is_ok());
    }

    #[test]
    fn test_parse_slave_spec() {
        assert_eq!(parse_slave_spec("lan0"), ("lan0", false));
        assert_eq!(parse_slave_spec("~guest0"), ("guest0", true));
    }
}
