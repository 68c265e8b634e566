// SPDX-License-Identifier: Apache-2.0 OR MIT
use clap::Parser;
use relay6d::config::{parse_slave_spec, Args, RelaydConfig};
use relay6d::engines::dhcpv6::Dhcpv6Relay;
use relay6d::engines::ndp::NdpProxy;
use relay6d::engines::router::RouterDiscovery;
use relay6d::logging::{Facility, Logger};
use relay6d::mux::EventLoop;
use relay6d::platform::interface::InterfaceRegistry;
use relay6d::platform::sysctl::sysctl_interface;
use relay6d::{log_error, log_warning};
use std::rc::Rc;

// Exit codes: 1 usage, 2 init, 3 interface open, 4 engine init,
// 5 nothing enabled, 6 daemonize failure
const EXIT_USAGE: i32 = 1;
const EXIT_INIT: i32 = 2;
const EXIT_INTERFACE: i32 = 3;
const EXIT_ENGINE: i32 = 4;
const EXIT_NO_RELAYS: i32 = 5;
const EXIT_DAEMONIZE: i32 = 6;

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            eprint!("{}", e);
            std::process::exit(EXIT_USAGE);
        }
        Err(e) => {
            // --help / --version
            print!("{}", e);
            std::process::exit(0);
        }
    };

    std::process::exit(run(args));
}

fn run(args: Args) -> i32 {
    let logger = Logger::stderr(args.verbose);
    let config = Rc::new(RelaydConfig::from_args(&args));

    // SAFETY: getuid has no preconditions.
    if unsafe { libc::getuid() } != 0 {
        log_error!(logger, Facility::Daemon, "Must be run as root. stopped.");
        return EXIT_INIT;
    }

    let slaves: Vec<(String, bool)> = args
        .slaves
        .iter()
        .map(|spec| {
            let (name, external) = parse_slave_spec(spec);
            (name.to_string(), external)
        })
        .collect();

    let registry = match InterfaceRegistry::open(&args.master, &slaves) {
        Ok(registry) => Rc::new(registry),
        Err(e) => {
            log_error!(logger, Facility::Daemon, &format!("{:#}", e));
            return EXIT_INTERFACE;
        }
    };

    if let Err(e) = config.validate(registry.slaves.len()) {
        log_warning!(logger, Facility::Daemon, &format!("{}. stopped.", e));
        return EXIT_NO_RELAYS;
    }

    let mut evloop = match EventLoop::new(registry.clone(), logger.clone()) {
        Ok(evloop) => evloop,
        Err(e) => {
            log_error!(logger, Facility::Daemon, &format!("{:#}", e));
            return EXIT_INIT;
        }
    };

    let router = match RouterDiscovery::init(
        config.clone(),
        registry.clone(),
        &mut evloop,
        logger.clone(),
    ) {
        Ok(router) => router,
        Err(e) => {
            log_error!(logger, Facility::RouterDiscovery, &format!("{:#}", e));
            return EXIT_ENGINE;
        }
    };

    let _dhcpv6 = match Dhcpv6Relay::init(
        config.clone(),
        registry.clone(),
        &mut evloop,
        logger.clone(),
    ) {
        Ok(dhcpv6) => dhcpv6,
        Err(e) => {
            log_error!(logger, Facility::Dhcpv6, &format!("{:#}", e));
            return EXIT_ENGINE;
        }
    };

    let ndp = match NdpProxy::init(
        config.clone(),
        registry.clone(),
        &mut evloop,
        logger.clone(),
    ) {
        Ok(ndp) => ndp,
        Err(e) => {
            log_error!(logger, Facility::NdpProxy, &format!("{:#}", e));
            return EXIT_ENGINE;
        }
    };

    if config.enable_forwarding {
        if let Err(e) = sysctl_interface("all", "forwarding", "1") {
            log_warning!(logger, Facility::Daemon, &format!("{:#}", e));
        }
    }

    if args.daemonize {
        // SAFETY: daemon(3) forks and detaches; no daemon state to preserve yet
        // beyond the sockets, which survive the fork.
        if unsafe { libc::daemon(0, 0) } < 0 {
            log_error!(
                logger,
                Facility::Daemon,
                &format!(
                    "Failed to daemonize: {}",
                    std::io::Error::last_os_error()
                )
            );
            return EXIT_DAEMONIZE;
        }
        let pid = std::process::id();
        if let Err(e) = std::fs::write(&args.pidfile, format!("{}\n", pid)) {
            log_warning!(
                logger,
                Facility::Daemon,
                &format!("Failed to write pidfile {}: {}", args.pidfile.display(), e)
            );
        }
    }

    let refresh_handle = router.clone();
    if let Err(e) = evloop.enable_signals(Box::new(move || {
        if let Some(router) = &refresh_handle {
            router.borrow().refresh();
        }
    })) {
        log_error!(logger, Facility::Daemon, &format!("{:#}", e));
        return EXIT_INIT;
    }

    if let Err(e) = evloop.run_until_stop() {
        log_error!(logger, Facility::Daemon, &format!("{:#}", e));
        return EXIT_INIT;
    }

    // Orderly shutdown: final zero-lifetime advertisements, sysctls restored
    if let Some(router) = &router {
        router.borrow_mut().shutdown();
    }
    if let Some(ndp) = &ndp {
        ndp.borrow().shutdown();
    }
    if config.enable_forwarding {
        if let Err(e) = sysctl_interface("all", "forwarding", "0") {
            log_warning!(logger, Facility::Daemon, &format!("{:#}", e));
        }
    }

    0
}
