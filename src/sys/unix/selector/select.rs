use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use parking_lot::Mutex;

use crate::event::{EventFlags, Events};
use crate::{Interest, Token};

#[derive(Debug)]
struct Registration {
    token: Token,
    interest: Option<Interest>,
}

/// Readiness via `select(2)`, the last-resort fallback.
///
/// Level-triggered only, and bounded by `FD_SETSIZE`: registering a
/// descriptor at or above that limit is rejected. Kept for hosts where
/// nothing better exists; the structure mirrors the `poll(2)` back-end.
#[derive(Debug)]
pub(crate) struct Selector {
    registrations: Mutex<HashMap<RawFd, Registration>>,
    notify_receiver: File,
    notify_sender: File,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let [receiver, sender] = crate::sys::pipe()?;
        // SAFETY: `pipe` returns two valid, owned fds.
        let notify_sender = unsafe { File::from_raw_fd(sender) };
        let notify_receiver = unsafe { File::from_raw_fd(receiver) };
        if notify_receiver.as_raw_fd() as usize >= libc::FD_SETSIZE {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        Ok(Selector {
            registrations: Mutex::new(HashMap::new()),
            notify_receiver,
            notify_sender,
        })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        // SAFETY: an all-zero fd_set is a valid empty set; FD_* macros keep
        // it consistent.
        let mut read_set: libc::fd_set = unsafe { mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { mem::zeroed() };
        let mut error_set: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut error_set);
        }

        let notify_fd = self.notify_receiver.as_raw_fd();
        unsafe { libc::FD_SET(notify_fd, &mut read_set) };
        let mut max_fd = notify_fd;

        let mut watched: Vec<(RawFd, Token, Interest)> = Vec::new();
        {
            let registrations = self.registrations.lock();
            for (fd, registration) in registrations.iter() {
                let interest = match registration.interest {
                    Some(interest) => interest,
                    None => continue,
                };
                unsafe {
                    if interest.is_readable() {
                        libc::FD_SET(*fd, &mut read_set);
                    }
                    if interest.is_writable() {
                        libc::FD_SET(*fd, &mut write_set);
                    }
                    libc::FD_SET(*fd, &mut error_set);
                }
                max_fd = max_fd.max(*fd);
                watched.push((*fd, registration.token, interest));
            }
        }

        let mut timeval = timeout.map(|to| libc::timeval {
            tv_sec: to.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_usec: to.subsec_micros() as libc::suseconds_t,
        });
        let timeval_ptr = timeval
            .as_mut()
            .map(|tv| tv as *mut libc::timeval)
            .unwrap_or(ptr::null_mut());

        syscall!(select(
            max_fd + 1,
            &mut read_set,
            &mut write_set,
            &mut error_set,
            timeval_ptr,
        ))?;

        if unsafe { libc::FD_ISSET(notify_fd, &read_set) } {
            self.drain_notify();
        }

        events.clear();
        let mut disarm = Vec::new();
        for (fd, token, interest) in watched {
            let readable = unsafe { libc::FD_ISSET(fd, &read_set) };
            let writable = unsafe { libc::FD_ISSET(fd, &write_set) };
            let error = unsafe { libc::FD_ISSET(fd, &error_set) };
            if !(readable || writable || error) {
                continue;
            }
            events.push(
                EventFlags::new()
                    .readable(readable)
                    .writable(writable)
                    .error(error)
                    .notifications(error)
                    .finish(token),
            );
            if interest.is_oneshot() {
                disarm.push(fd);
            }
        }

        if !disarm.is_empty() {
            let mut registrations = self.registrations.lock();
            for fd in disarm {
                if let Some(registration) = registrations.get_mut(&fd) {
                    registration.interest = None;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        let mut registrations = self.registrations.lock();
        if registrations.contains_key(&fd) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        registrations.insert(
            fd,
            Registration {
                token,
                interest: Some(interest),
            },
        );
        drop(registrations);
        self.wake_pollers();
        Ok(())
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut registrations = self.registrations.lock();
        match registrations.get_mut(&fd) {
            Some(registration) => {
                registration.token = token;
                registration.interest = Some(interest);
            }
            None => return Err(io::ErrorKind::NotFound.into()),
        }
        drop(registrations);
        self.wake_pollers();
        Ok(())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let found = self.registrations.lock().remove(&fd).is_some();
        if !found {
            return Err(io::ErrorKind::NotFound.into());
        }
        self.wake_pollers();
        Ok(())
    }

    fn wake_pollers(&self) {
        use std::io::Write;
        let _ = (&self.notify_sender).write(&[1]);
    }

    fn drain_notify(&self) {
        let mut buf = [0; 64];
        loop {
            match (&self.notify_receiver).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}
