//! The contract shared by the readiness and completion engines.

use std::sync::Arc;

use crate::strand::{Executor, Strand};
use crate::timer::{Timer, TimerCallback, TimerOptions};
use crate::{Interest, Result, Token};

/// An open OS descriptor; the identity of a socket to an engine. Unique
/// while open, closed exactly once by its owner.
pub type Handle = std::os::fd::RawFd;

/// The readiness device a reactor is built on.
///
/// Every back-end is functionally equivalent; the differences are in how
/// interest is communicated and how events are harvested. `Epoll` and
/// `Kqueue` honor edge triggering; `Poll` is the portable fallback and
/// `Select` the last resort.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    Epoll,
    Kqueue,
    Poll,
    Select,
}

impl Backend {
    /// The preferred back-end for the running platform.
    pub fn default_for_platform() -> Backend {
        #[cfg(any(target_os = "android", target_os = "linux"))]
        {
            Backend::Epoll
        }
        #[cfg(any(
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "openbsd",
        ))]
        {
            Backend::Kqueue
        }
        #[cfg(not(any(
            target_os = "android",
            target_os = "linux",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "openbsd",
        )))]
        {
            Backend::Poll
        }
    }
}

/// Per-waiter options for [`Driver::run`].
#[derive(Clone, Debug, Default)]
pub struct WaiterOptions {
    /// A tag for the waiting thread, used in logs.
    pub name: Option<String>,
}

/// The callbacks an engine delivers to an attached socket.
///
/// A reactor reports readiness and the socket performs the I/O; the
/// completion engine uses only the identity and detach surfaces of this
/// trait and delivers operation results through the continuations stored
/// with each submitted operation.
pub trait DriverSocket: Send + Sync {
    /// The descriptor the engine monitors.
    fn handle(&self) -> Handle;

    /// The handle is ready for reading.
    fn process_readable(&self);

    /// The handle is ready for writing.
    fn process_writable(&self);

    /// The handle is in an error state; the socket owns the descriptor and
    /// retrieves the pending error itself.
    fn process_error(&self);

    /// Out-of-band notifications (error-queue completions) are pending.
    fn process_notifications(&self) {}

    /// The engine has stopped posting events for the handle and drained
    /// pending completions; the socket may now release the descriptor.
    fn process_detached(&self);
}

/// The external contract shared by the reactor and proactor shapes.
///
/// `show`/`hide` communicate interest: for a reactor this enables or
/// disables readiness reporting; for a proactor, showing a direction starts
/// harvesting the completion-returning operations queued in that direction.
pub trait Driver: Executor + Send + Sync + 'static {
    /// Registers a socket, returning the token its events will carry.
    fn attach(&self, socket: Arc<dyn DriverSocket>) -> Result<Token>;

    /// Begins orderly removal: the engine stops posting new events for the
    /// handle, drains pending completions, then invokes
    /// [`DriverSocket::process_detached`].
    fn detach(&self, token: Token) -> Result<()>;

    /// Enables interest.
    fn show(&self, token: Token, interest: Interest) -> Result<()>;

    /// Disables interest.
    fn hide(&self, token: Token, interest: Interest) -> Result<()>;

    /// Schedules a deadline; the session callback fires on the engine
    /// thread (or the timer's strand) with the drift recorded.
    fn add_timer(&self, options: TimerOptions, session: TimerCallback) -> Result<Timer>;

    /// Cancels a pending timer. The session observes a `Canceled` event;
    /// a canceled timer never produces a deadline event. Returns false if
    /// the timer was no longer pending.
    fn remove_timer(&self, id: usize) -> bool;

    /// Blocks the calling thread harvesting events and dispatching
    /// callbacks until the engine is stopped.
    fn run(&self, waiter: &WaiterOptions) -> Result<()>;

    /// Wakes every thread currently blocked in [`Driver::run`].
    fn interrupt(&self);

    /// Asks all waiters to return once outstanding completions drain.
    fn stop(&self);

    /// The engine's own serialized execution context.
    fn strand(&self) -> Arc<Strand>;

    /// A fresh strand draining onto this engine's threads, for sockets that
    /// want callback serialization apart from the engine strand.
    fn new_strand(&self) -> Arc<Strand>;
}
