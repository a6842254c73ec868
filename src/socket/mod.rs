//! Socket state machines.

pub mod datagram;
pub mod event;
pub mod listener;
pub mod options;
pub mod stream;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::socket::event::{
    DowngradeEvent, ErrorEvent, ShutdownEvent, UpgradeEvent, WatermarkEvent,
};

pub use datagram::DatagramSocket;
pub use listener::ListenerSocket;
pub use stream::StreamSocket;

/// The lifecycle of a socket's handle.
///
/// `default → waiting → connecting → connected → closed`; `closed` is
/// terminal and never re-entered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenState {
    /// No handle allocated yet.
    Default,
    /// Handle allocated, not yet connecting or listening.
    Waiting,
    /// A connect is in flight.
    Connecting,
    /// Connected, or listening for a listener.
    Connected,
    Closed,
}

/// Coordinates orderly removal of a socket from its engine while operations
/// may still be in flight.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DetachState {
    Idle,
    /// The engine was asked to stop posting events for the handle.
    Initiated,
    /// The engine finished draining; the detach completion is scheduled on
    /// the socket's strand.
    Scheduled,
}

/// Out-of-band observations a socket reports beside its operation
/// callbacks: watermark crossings, shutdown progress, encryption upgrade
/// and downgrade transitions, and unclassified failures.
///
/// All observers run on the socket's strand, serialized with the socket's
/// operation callbacks.
pub trait SocketSession: Send + Sync {
    fn on_watermark(&self, _event: WatermarkEvent) {}
    fn on_shutdown(&self, _event: ShutdownEvent) {}
    fn on_upgrade(&self, _event: UpgradeEvent) {}
    fn on_downgrade(&self, _event: DowngradeEvent) {}
    fn on_error(&self, _event: ErrorEvent) {}
}

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_socket_id() -> u64 {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// Default queue watermarks: no low threshold, 64 KiB high threshold.
pub(crate) const DEFAULT_WATERMARKS: (usize, usize) = (0, 64 * 1024);
