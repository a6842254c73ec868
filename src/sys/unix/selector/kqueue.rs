use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::event::{EventFlags, Events};
use crate::{Interest, Token};

/// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "ios", target_os = "macos"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
type Filter = u32;

/// Type of the `flags` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "ios", target_os = "macos"))]
type Flags = libc::c_ushort;
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
type Flags = u32;

/// Type of the `udata` field in the `kevent` structure.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $data: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags as Flags,
            udata: $data as UData,
            // Remaining fields (fflags, data, and any extensions) zeroed.
            ..unsafe { mem::zeroed() }
        }
    };
}

#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        // SAFETY: `kqueue(2)` ensures the fd is valid.
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };
        syscall!(fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timespec = timeout.map(|to| libc::timespec {
            tv_sec: to.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timespec_ptr = timespec
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        let mut sys_events: Vec<libc::kevent> = Vec::with_capacity(events.capacity());
        let n_events = syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            sys_events.as_mut_ptr(),
            sys_events.capacity() as libc::c_int,
            timespec_ptr,
        ))?;
        // SAFETY: `kevent(2)` ensures that `n_events` are assigned.
        unsafe { sys_events.set_len(n_events as usize) };

        events.clear();
        for sys_event in &sys_events {
            events.push(normalize(sys_event));
        }
        Ok(())
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut flags = libc::EV_ADD | libc::EV_RECEIPT;
        if interest.is_edge() {
            flags |= libc::EV_CLEAR;
        }
        if interest.is_oneshot() {
            flags |= libc::EV_ONESHOT;
        }

        let mut changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_READ, flags, token.0),
            kevent!(fd, libc::EVFILT_WRITE, flags, token.0),
        ];
        let n_changes = match (interest.is_readable(), interest.is_writable()) {
            (true, true) => 2,
            (true, false) => 1,
            (false, true) => {
                changes.swap(0, 1);
                1
            }
            (false, false) => 0,
        };

        self.apply(&mut changes[..n_changes], &[])
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        // kqueue keeps one entry per (ident, filter); dropping the filters
        // the new interest no longer wants and re-adding the rest updates
        // the registration in one change list.
        let delete_flags = libc::EV_DELETE | libc::EV_RECEIPT;
        let mut add_flags = libc::EV_ADD | libc::EV_RECEIPT;
        if interest.is_edge() {
            add_flags |= libc::EV_CLEAR;
        }
        if interest.is_oneshot() {
            add_flags |= libc::EV_ONESHOT;
        }

        let mut changes: [libc::kevent; 2] = [
            kevent!(
                fd,
                libc::EVFILT_READ,
                if interest.is_readable() { add_flags } else { delete_flags },
                token.0
            ),
            kevent!(
                fd,
                libc::EVFILT_WRITE,
                if interest.is_writable() { add_flags } else { delete_flags },
                token.0
            ),
        ];

        // A delete for a filter that was never added reports ENOENT; that is
        // the expected outcome of narrowing interest.
        self.apply(&mut changes, &[libc::ENOENT])
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let flags = libc::EV_DELETE | libc::EV_RECEIPT;
        let mut changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_READ, flags, 0),
            kevent!(fd, libc::EVFILT_WRITE, flags, 0),
        ];
        self.apply(&mut changes, &[libc::ENOENT])
    }

    /// Submits a change list, reading back per-change receipts.
    fn apply(&self, changes: &mut [libc::kevent], ignored: &[i32]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as libc::c_int,
            changes.as_mut_ptr(),
            changes.len() as libc::c_int,
            ptr::null(),
        ))?;
        for change in changes.iter() {
            if (change.flags & libc::EV_ERROR != 0)
                && change.data != 0
                && !ignored.contains(&(change.data as i32))
            {
                return Err(io::Error::from_raw_os_error(change.data as i32));
            }
        }
        Ok(())
    }
}

fn normalize(event: &libc::kevent) -> crate::event::Event {
    let readable = event.filter == libc::EVFILT_READ as Filter;
    let writable = event.filter == libc::EVFILT_WRITE as Filter;
    let eof = event.flags & libc::EV_EOF != 0;
    EventFlags::new()
        .readable(readable)
        .writable(writable)
        .error(event.flags & libc::EV_ERROR != 0 || (eof && event.fflags != 0))
        .read_closed(readable && eof)
        .write_closed(writable && eof)
        .notifications(false)
        .finish(Token(event.udata as usize))
}
