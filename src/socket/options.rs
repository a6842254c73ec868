//! Option bags for socket operations.

use std::time::{Duration, Instant};

/// Options applied when a handle is opened or bound.
#[derive(Clone, Debug, Default)]
pub struct SocketOptions {
    pub reuse_address: bool,
    pub keep_alive: bool,
    /// Disable Nagle's algorithm on TCP transports.
    pub no_delay: bool,
    pub linger: Option<Duration>,
    pub send_buffer_size: Option<usize>,
    pub receive_buffer_size: Option<usize>,
    /// Watermarks for the send queue; defaults to `(0, 64 KiB)`.
    pub send_watermarks: Option<(usize, usize)>,
    /// Watermarks for the receive queue; defaults to `(0, 64 KiB)`.
    pub receive_watermarks: Option<(usize, usize)>,
}

/// How connect-by-name turns a resolution into attempts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectStrategy {
    /// Use the first resolved endpoint only.
    ResolveIntoSingle,
    /// Attempt resolved endpoints in order, failing over on each
    /// non-success.
    ResolveIntoList,
}

#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub deadline: Option<Instant>,
    /// Permit synchronous completion when the submitting thread is already
    /// on the callback's strand.
    pub recurse: bool,
    pub strategy: ConnectStrategy,
}

impl Default for ConnectOptions {
    fn default() -> ConnectOptions {
        ConnectOptions {
            deadline: None,
            recurse: false,
            strategy: ConnectStrategy::ResolveIntoSingle,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub deadline: Option<Instant>,
    pub recurse: bool,
    /// Enqueue even when the send queue is over its high watermark instead
    /// of failing with `WouldBlock`.
    pub force: bool,
    /// Transmit via kernel zero-copy where the platform offers it; the
    /// completion is reported once the kernel releases the buffer.
    pub zero_copy: bool,
    /// Record a software timestamp of the final drain in the completion.
    pub timestamping: bool,
}

#[derive(Clone, Debug)]
pub struct ReceiveOptions {
    pub deadline: Option<Instant>,
    pub recurse: bool,
    /// The operation completes only once this many bytes are available (or
    /// the socket is shut down for receive, or the deadline fires).
    pub min_size: usize,
    pub max_size: usize,
}

impl Default for ReceiveOptions {
    fn default() -> ReceiveOptions {
        ReceiveOptions {
            deadline: None,
            recurse: false,
            min_size: 1,
            max_size: 65_536,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AcceptOptions {
    pub deadline: Option<Instant>,
    pub recurse: bool,
}

/// Which direction(s) a shutdown applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShutdownType {
    Send,
    Receive,
    Both,
}

impl ShutdownType {
    pub fn applies_to_send(self) -> bool {
        matches!(self, ShutdownType::Send | ShutdownType::Both)
    }

    pub fn applies_to_receive(self) -> bool {
        matches!(self, ShutdownType::Receive | ShutdownType::Both)
    }
}

/// `Graceful` drains the affected queue before closing the direction;
/// `Immediate` closes it at once and fails pending operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShutdownMode {
    Immediate,
    Graceful,
}
