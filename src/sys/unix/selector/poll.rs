use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

use parking_lot::Mutex;

use crate::event::{EventFlags, Events};
use crate::{Interest, Token};

#[derive(Debug)]
struct Registration {
    token: Token,
    // `None` while disarmed by one-shot delivery.
    interest: Option<Interest>,
}

/// Readiness via `poll(2)`, the portable fallback.
///
/// The kernel keeps no interest state for `poll`, so the selector keeps the
/// registration table itself and rebuilds the `pollfd` array on every wait.
/// A self-pipe is part of every wait so that registration changes made from
/// other threads interrupt an in-flight wait promptly.
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
        Ok(Selector {
            registrations: Mutex::new(HashMap::new()),
            notify_receiver,
            notify_sender,
        })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut tokens: Vec<(Token, Interest)> = Vec::new();

        fds.push(libc::pollfd {
            fd: self.notify_receiver.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });

        {
            let registrations = self.registrations.lock();
            for (fd, registration) in registrations.iter() {
                let interest = match registration.interest {
                    Some(interest) => interest,
                    None => continue,
                };
                let mut mask = 0;
                if interest.is_readable() {
                    mask |= libc::POLLIN;
                    #[cfg(any(target_os = "android", target_os = "linux"))]
                    {
                        mask |= libc::POLLRDHUP;
                    }
                }
                if interest.is_writable() {
                    mask |= libc::POLLOUT;
                }
                if interest.is_notifications() {
                    mask |= libc::POLLPRI;
                }
                fds.push(libc::pollfd {
                    fd: *fd,
                    events: mask,
                    revents: 0,
                });
                tokens.push((registration.token, interest));
            }
        }

        let timeout = super::millis(timeout);
        syscall!(poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout))?;

        if fds[0].revents != 0 {
            self.drain_notify();
        }

        events.clear();
        let mut disarm = Vec::new();
        for (pollfd, (token, interest)) in fds[1..].iter().zip(tokens.iter()) {
            if pollfd.revents == 0 {
                continue;
            }
            events.push(normalize(pollfd.revents, *token));
            if interest.is_oneshot() {
                disarm.push(pollfd.fd);
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

fn normalize(revents: libc::c_short, token: Token) -> crate::event::Event {
    let bits = revents as libc::c_int;
    let pollin = libc::POLLIN as libc::c_int;
    let pollout = libc::POLLOUT as libc::c_int;
    let pollerr = libc::POLLERR as libc::c_int;
    let pollhup = libc::POLLHUP as libc::c_int;
    let pollpri = libc::POLLPRI as libc::c_int;
    let pollnval = libc::POLLNVAL as libc::c_int;

    #[cfg(any(target_os = "android", target_os = "linux"))]
    let read_hup = bits & libc::POLLRDHUP as libc::c_int != 0;
    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    let read_hup = false;

    EventFlags::new()
        .readable(bits & (pollin | pollpri) != 0)
        .writable(bits & pollout != 0)
        .error(bits & (pollerr | pollnval) != 0)
        .read_closed(bits & pollhup != 0 || (bits & pollin != 0 && read_hup))
        .write_closed(
            bits & pollhup != 0 || (bits & pollout != 0 && bits & pollerr != 0) || bits == pollerr,
        )
        .notifications(bits & (pollerr | pollpri) != 0)
        .finish(token)
}
