use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::driver::Backend;
use crate::event::Events;
use crate::{Interest, Token};

#[cfg(any(target_os = "android", target_os = "linux"))]
mod epoll;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
))]
mod kqueue;

mod poll;
mod select;

/// The readiness device behind a reactor.
///
/// The back-end is chosen at construction; every back-end answers the same
/// calls, the differences are in how interest is communicated to the kernel
/// and how events are harvested.
#[derive(Debug)]
pub(crate) enum Selector {
    #[cfg(any(target_os = "android", target_os = "linux"))]
    Epoll(epoll::Selector),
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
    ))]
    Kqueue(kqueue::Selector),
    Poll(poll::Selector),
    Select(select::Selector),
}

impl Selector {
    pub(crate) fn new(backend: Backend) -> io::Result<Selector> {
        match backend {
            #[cfg(any(target_os = "android", target_os = "linux"))]
            Backend::Epoll => epoll::Selector::new().map(Selector::Epoll),
            #[cfg(not(any(target_os = "android", target_os = "linux")))]
            Backend::Epoll => Err(io::ErrorKind::Unsupported.into()),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            ))]
            Backend::Kqueue => kqueue::Selector::new().map(Selector::Kqueue),
            #[cfg(not(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            )))]
            Backend::Kqueue => Err(io::ErrorKind::Unsupported.into()),
            Backend::Poll => poll::Selector::new().map(Selector::Poll),
            Backend::Select => select::Selector::new().map(Selector::Select),
        }
    }

    /// True when the back-end honors `Interest::EDGE`.
    pub(crate) fn supports_edge(&self) -> bool {
        match self {
            #[cfg(any(target_os = "android", target_os = "linux"))]
            Selector::Epoll(_) => true,
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            ))]
            Selector::Kqueue(_) => true,
            Selector::Poll(_) | Selector::Select(_) => false,
        }
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "android", target_os = "linux"))]
            Selector::Epoll(selector) => selector.select(events, timeout),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            ))]
            Selector::Kqueue(selector) => selector.select(events, timeout),
            Selector::Poll(selector) => selector.select(events, timeout),
            Selector::Select(selector) => selector.select(events, timeout),
        }
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if interest.is_edge() && !self.supports_edge() {
            return Err(io::ErrorKind::Unsupported.into());
        }
        match self {
            #[cfg(any(target_os = "android", target_os = "linux"))]
            Selector::Epoll(selector) => selector.register(fd, token, interest),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            ))]
            Selector::Kqueue(selector) => selector.register(fd, token, interest),
            Selector::Poll(selector) => selector.register(fd, token, interest),
            Selector::Select(selector) => selector.register(fd, token, interest),
        }
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if interest.is_edge() && !self.supports_edge() {
            return Err(io::ErrorKind::Unsupported.into());
        }
        match self {
            #[cfg(any(target_os = "android", target_os = "linux"))]
            Selector::Epoll(selector) => selector.reregister(fd, token, interest),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            ))]
            Selector::Kqueue(selector) => selector.reregister(fd, token, interest),
            Selector::Poll(selector) => selector.reregister(fd, token, interest),
            Selector::Select(selector) => selector.reregister(fd, token, interest),
        }
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "android", target_os = "linux"))]
            Selector::Epoll(selector) => selector.deregister(fd),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
            ))]
            Selector::Kqueue(selector) => selector.deregister(fd),
            Selector::Poll(selector) => selector.deregister(fd),
            Selector::Select(selector) => selector.deregister(fd),
        }
    }
}

/// Rounds a poll timeout up to whole milliseconds.
///
/// `Duration::as_millis` truncates; rounding up avoids turning a
/// sub-millisecond timeout into a busy zero timeout unless the caller
/// explicitly asked for zero.
pub(crate) fn millis(timeout: Option<Duration>) -> libc::c_int {
    timeout
        .map(|to| {
            to.checked_add(Duration::from_nanos(999_999))
                .unwrap_or(to)
                .as_millis()
                .min(libc::c_int::MAX as u128) as libc::c_int
        })
        .unwrap_or(-1)
}
