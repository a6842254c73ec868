/// Helper macro to execute a system call that returns an `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) mod net;
mod selector;
mod waker;

pub(crate) use selector::Selector;
pub(crate) use waker::Waker;

use std::io;
use std::os::fd::RawFd;

/// Creates a non-blocking, close-on-exec pipe pair `[read, write]`.
pub(crate) fn pipe() -> io::Result<[RawFd; 2]> {
    let mut fds: [RawFd; 2] = [-1, -1];

    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd",
    ))]
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;

    #[cfg(any(target_os = "ios", target_os = "macos"))]
    {
        syscall!(pipe(fds.as_mut_ptr()))?;
        for fd in &fds {
            if let Err(err) = syscall!(fcntl(*fd, libc::F_SETFL, libc::O_NONBLOCK))
                .and_then(|_| syscall!(fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC)))
            {
                let _ = syscall!(close(fds[0]));
                let _ = syscall!(close(fds[1]));
                return Err(err);
            }
        }
    }

    Ok(fds)
}
