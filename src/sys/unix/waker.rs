use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// The engine wakeup controller.
///
/// Registered with the selector as readable; `wake` makes the handle
/// readable, `ack` drains it. On Linux-class hosts this is an `eventfd`, a
/// 64-bit counter where every write adds and a read resets; elsewhere it is
/// a non-blocking pipe pair.
#[derive(Debug)]
pub(crate) struct Waker {
    inner: WakerInternal,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        Ok(Waker {
            inner: WakerInternal::new()?,
        })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        self.inner.wake()
    }

    /// Drains pending wakeups so the handle stops reporting readable.
    pub(crate) fn ack(&self) {
        self.inner.ack();
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(any(target_os = "android", target_os = "linux"))]
use self::eventfd::WakerInternal;

#[cfg(any(target_os = "android", target_os = "linux"))]
mod eventfd {
    use super::*;

    #[derive(Debug)]
    pub(crate) struct WakerInternal {
        fd: File,
    }

    impl WakerInternal {
        pub(crate) fn new() -> io::Result<WakerInternal> {
            let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
            // SAFETY: `eventfd(2)` ensures the fd is valid.
            let file = unsafe { File::from_raw_fd(fd) };
            Ok(WakerInternal { fd: file })
        }

        #[allow(clippy::unused_io_amount)] // Don't care about partial writes.
        pub(crate) fn wake(&self) -> io::Result<()> {
            let buf: [u8; 8] = 1u64.to_ne_bytes();
            match (&self.fd).write(&buf) {
                Ok(_) => Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Writing only blocks if the counter is about to
                    // overflow; reset it and wake again.
                    self.ack();
                    self.wake()
                }
                Err(err) => Err(err),
            }
        }

        #[allow(clippy::unused_io_amount)] // Don't care about partial reads.
        pub(crate) fn ack(&self) {
            let mut buf: [u8; 8] = 0u64.to_ne_bytes();
            let _ = (&self.fd).read(&mut buf);
        }
    }

    impl AsRawFd for WakerInternal {
        fn as_raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
use self::pipe::WakerInternal;

#[cfg(not(any(target_os = "android", target_os = "linux")))]
mod pipe {
    use super::*;

    /// Waker backed by a unix pipe; controls both ends and empties the pipe
    /// if writing to it (waking) fails.
    #[derive(Debug)]
    pub(crate) struct WakerInternal {
        sender: File,
        receiver: File,
    }

    impl WakerInternal {
        pub(crate) fn new() -> io::Result<WakerInternal> {
            let [receiver, sender] = crate::sys::pipe()?;
            // SAFETY: `pipe` returns two valid, owned fds.
            let sender = unsafe { File::from_raw_fd(sender) };
            let receiver = unsafe { File::from_raw_fd(receiver) };
            Ok(WakerInternal { sender, receiver })
        }

        pub(crate) fn wake(&self) -> io::Result<()> {
            match (&self.sender).write(&[1]) {
                Ok(_) => Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // The reading end is full; empty the buffer and retry.
                    self.ack();
                    self.wake()
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
                Err(err) => Err(err),
            }
        }

        pub(crate) fn ack(&self) {
            let mut buf = [0; 4096];
            loop {
                match (&self.receiver).read(&mut buf) {
                    Ok(n) if n > 0 => continue,
                    _ => return,
                }
            }
        }
    }

    impl AsRawFd for WakerInternal {
        fn as_raw_fd(&self) -> RawFd {
            self.receiver.as_raw_fd()
        }
    }
}
