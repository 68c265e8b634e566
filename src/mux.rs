// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Single-threaded event multiplexer.
//!
//! One edge-triggered epoll instance serializes all ingress, timer firings
//! and signal handling. Handlers run to completion; the only suspension point
//! is the wait call. Datagram sockets are drained until the read would block
//! before the next source is serviced - draining is the multiplexer's job,
//! handlers see one datagram at a time.

use crate::logging::{Facility, Logger};
use crate::platform::interface::{Interface, InterfaceRegistry};
use crate::RELAYD_BUFFER_SIZE;
use anyhow::{Context, Result};
use std::cell::Cell;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

const MAX_EVENTS: usize = 16;

/// Where a datagram came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvSource {
    /// UDP or raw IPv6 socket; the peer address including its source port
    Udp(SocketAddrV6),
    /// Packet socket; the interface is carried separately
    Link,
}

impl RecvSource {
    pub fn udp(&self) -> Option<&SocketAddrV6> {
        match self {
            RecvSource::Udp(addr) => Some(addr),
            RecvSource::Link => None,
        }
    }
}

/// Handler for one received datagram: source, payload, ingress interface.
pub type DatagramHandler = Box<dyn FnMut(&RecvSource, &[u8], &Interface)>;

/// Handler for a timer expiry. Re-arming the timer is the handler's job.
pub type TimerHandler = Box<dyn FnMut()>;

/// A one-shot monotonic timerfd. The owner re-arms it from its handler.
pub struct MonotonicTimer {
    fd: OwnedFd,
}

impl MonotonicTimer {
    pub fn new() -> Result<Self> {
        // SAFETY: plain timerfd_create(2) call; the result is checked.
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("timerfd_create failed");
        }
        // SAFETY: fd was just created and verified valid.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Arm the timer to fire once after `delay`. A zero delay fires almost
    /// immediately (timerfd treats an all-zero value as disarm).
    pub fn arm(&self, delay: Duration) -> Result<()> {
        let mut value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        if value.it_value.tv_sec == 0 && value.it_value.tv_nsec == 0 {
            value.it_value.tv_nsec = 1;
        }
        // SAFETY: value is a fully initialized itimerspec.
        let res =
            unsafe { libc::timerfd_settime(self.fd.as_raw_fd(), 0, &value, std::ptr::null_mut()) };
        if res < 0 {
            return Err(std::io::Error::last_os_error()).context("timerfd_settime failed");
        }
        Ok(())
    }

    /// Swallow the overrun counter after an expiry.
    fn consume(&self) {
        let mut overrun = [0u8; 8];
        // SAFETY: reading 8 bytes into a valid buffer; errors are irrelevant
        // here (EAGAIN when fired synchronously).
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                overrun.as_mut_ptr() as *mut libc::c_void,
                overrun.len(),
            );
        }
    }
}

impl AsRawFd for MonotonicTimer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

enum Registration {
    Datagram {
        fd: Rc<OwnedFd>,
        handler: DatagramHandler,
    },
    Timer {
        timer: Rc<MonotonicTimer>,
        handler: TimerHandler,
    },
    Signal {
        fd: OwnedFd,
        refresh: Box<dyn FnMut()>,
    },
}

/// The readiness loop. Engines register sources at init; nothing is ever
/// deregistered before shutdown.
pub struct EventLoop {
    epoll: OwnedFd,
    registrations: Vec<Registration>,
    registry: Rc<InterfaceRegistry>,
    stop: Rc<Cell<bool>>,
    logger: Logger,
}

impl EventLoop {
    pub fn new(registry: Rc<InterfaceRegistry>, logger: Logger) -> Result<Self> {
        // SAFETY: plain epoll_create1(2) call; the result is checked.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("Unable to open epoll");
        }
        Ok(Self {
            // SAFETY: fd was just created and verified valid.
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            registrations: Vec::new(),
            registry,
            stop: Rc::new(Cell::new(false)),
            logger,
        })
    }

    fn epoll_add(&self, fd: RawFd, index: usize) -> Result<()> {
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: index as u64,
        };
        // SAFETY: event is fully initialized and the fds are valid.
        let res = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        };
        if res < 0 {
            return Err(std::io::Error::last_os_error()).context("epoll_ctl failed");
        }
        Ok(())
    }

    /// Register a datagram source. The multiplexer drains it on readiness and
    /// invokes the handler once per datagram with the resolved interface.
    pub fn register_datagram(&mut self, fd: Rc<OwnedFd>, handler: DatagramHandler) -> Result<()> {
        let index = self.registrations.len();
        self.epoll_add(fd.as_raw_fd(), index)?;
        self.registrations.push(Registration::Datagram { fd, handler });
        Ok(())
    }

    /// Register a timer. The overrun counter is consumed before the handler
    /// runs; the handler is expected to re-arm the timer.
    pub fn register_timer(&mut self, timer: Rc<MonotonicTimer>, handler: TimerHandler) -> Result<()> {
        let index = self.registrations.len();
        self.epoll_add(timer.as_raw_fd(), index)?;
        self.registrations.push(Registration::Timer { timer, handler });
        Ok(())
    }

    /// Request loop termination. The flag is checked between dispatches.
    pub fn stop(&self) {
        self.stop.set(true);
    }

    /// Fold signal delivery into the loop: SIGTERM/SIGINT/SIGHUP stop it,
    /// SIGUSR1 runs the refresh callback.
    pub fn enable_signals(&mut self, refresh: Box<dyn FnMut()>) -> Result<()> {
        // SAFETY: sigset_t manipulation with locally owned storage; signalfd
        // takes over delivery for exactly the signals blocked here.
        let fd = unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            for sig in [libc::SIGTERM, libc::SIGINT, libc::SIGHUP, libc::SIGUSR1] {
                libc::sigaddset(&mut set, sig);
            }
            if libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) < 0 {
                return Err(std::io::Error::last_os_error()).context("sigprocmask failed");
            }
            let fd = libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
            if fd < 0 {
                return Err(std::io::Error::last_os_error()).context("signalfd failed");
            }
            OwnedFd::from_raw_fd(fd)
        };

        let index = self.registrations.len();
        self.epoll_add(fd.as_raw_fd(), index)?;
        self.registrations.push(Registration::Signal { fd, refresh });
        Ok(())
    }

    /// Run until a stop is requested. Handlers are dispatched sequentially.
    pub fn run_until_stop(&mut self) -> Result<()> {
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            // SAFETY: epoll_event is plain old data, zero is a valid value.
            unsafe { std::mem::zeroed() };

        while !self.stop.get() {
            // SAFETY: events points to MAX_EVENTS writable entries.
            let count = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    -1,
                )
            };
            if count < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err).context("epoll_wait failed");
            }

            for event in events.iter().take(count as usize) {
                self.dispatch(event.u64 as usize);
                if self.stop.get() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, index: usize) {
        let logger = self.logger.clone();
        let registry = self.registry.clone();

        let Some(registration) = self.registrations.get_mut(index) else {
            return;
        };

        match registration {
            Registration::Datagram { fd, handler } => {
                receive_datagrams(&logger, &registry, fd.as_raw_fd(), handler);
            }
            Registration::Timer { timer, handler } => {
                timer.consume();
                handler();
            }
            Registration::Signal { fd, refresh } => loop {
                // SAFETY: reading into a fully sized, writable siginfo.
                let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
                let n = unsafe {
                    libc::read(
                        fd.as_raw_fd(),
                        &mut info as *mut _ as *mut libc::c_void,
                        std::mem::size_of::<libc::signalfd_siginfo>(),
                    )
                };
                if n < std::mem::size_of::<libc::signalfd_siginfo>() as isize {
                    break;
                }
                match info.ssi_signo as libc::c_int {
                    libc::SIGUSR1 => refresh(),
                    libc::SIGTERM | libc::SIGINT | libc::SIGHUP => {
                        logger.warning(Facility::EventLoop, "Termination requested by signal.");
                        self.stop.set(true);
                    }
                    _ => {}
                }
            },
        }
    }
}

/// Drain a readable socket, invoking the handler once per datagram.
fn receive_datagrams(
    logger: &Logger,
    registry: &InterfaceRegistry,
    fd: RawFd,
    handler: &mut DatagramHandler,
) {
    loop {
        let mut data_buf = [0u8; RELAYD_BUFFER_SIZE];
        // 8-byte aligned ancillary space (128 bytes)
        let mut cmsg_buf = [0u64; 16];
        // SAFETY: sockaddr_storage and msghdr are plain old data.
        let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: data_buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: data_buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut addr as *mut _ as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = std::mem::size_of_val(&cmsg_buf);

        // SAFETY: msg points to valid name/iov/control buffers built above.
        let len = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT) };
        if len < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => break,
                Some(libc::EINTR) => continue,
                _ => {
                    logger.warning(Facility::EventLoop, &format!("recvmsg failed: {}", err));
                    break;
                }
            }
        }
        let len = len as usize;

        // Destination interface from IPV6_PKTINFO
        let mut dest_iface = 0u32;
        // SAFETY: the cmsg macros walk only within msg_control/msg_controllen
        // as filled in by the kernel.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::IPPROTO_IPV6
                    && (*cmsg).cmsg_type == libc::IPV6_PKTINFO
                {
                    let pktinfo: libc::in6_pktinfo =
                        std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
                    dest_iface = pktinfo.ipi6_ifindex as u32;
                    break;
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        let family = addr.ss_family as libc::c_int;

        // Packet sockets carry the interface in the link-level address
        if family == libc::AF_PACKET {
            // SAFETY: the kernel filled a sockaddr_ll for AF_PACKET sockets.
            let sll: libc::sockaddr_ll =
                unsafe { std::ptr::read_unaligned(&addr as *const _ as *const libc::sockaddr_ll) };
            dest_iface = sll.sll_ifindex as u32;
        }

        let Some(iface) = registry.by_index(dest_iface) else {
            continue;
        };

        let source = if family == libc::AF_INET6 {
            // SAFETY: the kernel filled a sockaddr_in6 for AF_INET6 sockets.
            let sin6: libc::sockaddr_in6 =
                unsafe { std::ptr::read_unaligned(&addr as *const _ as *const libc::sockaddr_in6) };
            RecvSource::Udp(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            ))
        } else {
            RecvSource::Link
        };

        if logger.enabled(crate::logging::Severity::Notice) {
            let from = match &source {
                RecvSource::Udp(peer) => peer.ip().to_string(),
                RecvSource::Link => "link".to_string(),
            };
            logger.notice(
                Facility::EventLoop,
                &format!("Received {} bytes from {}%{}", len, from, iface.name),
            );
        }

        handler(&source, &data_buf[..len], iface);
    }
}
