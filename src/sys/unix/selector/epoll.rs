use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::event::{EventFlags, Events};
use crate::{Interest, Token};

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = super::millis(timeout);

        let mut sys_events: Vec<libc::epoll_event> = Vec::with_capacity(events.capacity());
        let n_events = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            sys_events.as_mut_ptr(),
            sys_events.capacity() as i32,
            timeout,
        ))?;
        // SAFETY: `epoll_wait` ensures that `n_events` are assigned.
        unsafe { sys_events.set_len(n_events as usize) };

        events.clear();
        for sys_event in &sys_events {
            events.push(normalize(sys_event));
        }
        Ok(())
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: usize::from(token) as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: usize::from(token) as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())).map(|_| ())
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind = kind | EPOLLIN | EPOLLRDHUP;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    if interest.is_notifications() {
        kind |= EPOLLPRI;
    }
    if interest.is_edge() {
        kind |= EPOLLET;
    }
    if interest.is_oneshot() {
        kind |= EPOLLONESHOT;
    }

    kind as u32
}

fn normalize(event: &libc::epoll_event) -> crate::event::Event {
    let bits = event.events as libc::c_int;
    EventFlags::new()
        .readable(bits & (EPOLLIN | EPOLLPRI) != 0)
        .writable(bits & EPOLLOUT != 0)
        .error(bits & EPOLLERR != 0)
        // Both halves closed, or the peer sent FIN / shut down its send side.
        .read_closed(bits & EPOLLHUP != 0 || (bits & EPOLLIN != 0 && bits & EPOLLRDHUP != 0))
        .write_closed(
            bits & EPOLLHUP != 0
                || (bits & EPOLLOUT != 0 && bits & EPOLLERR != 0)
                || bits == EPOLLERR,
        )
        // Error-queue (zero-copy, timestamp) arrivals surface as EPOLLERR or
        // EPOLLPRI; the socket decides whether its notification interest
        // claims them.
        .notifications(bits & (EPOLLERR | EPOLLPRI) != 0)
        .finish(Token(event.u64 as usize))
}
