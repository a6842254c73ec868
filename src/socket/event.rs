//! Operation events.
//!
//! Every event is a `{type, context}` pair: the type classifies the outcome
//! (`Complete`, `Error`, `Initiated`, `Canceled`, `Closed`, `Deadline`), the
//! context carries the operation-specific fields.

use std::time::Instant;

use crate::endpoint::Endpoint;
use crate::queue::{QueueContext, QueueDirection, WatermarkKind};
use crate::Error;

/// The outcome classifier shared by all operation events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventType {
    Complete,
    Error,
    Initiated,
    Canceled,
    Closed,
    Deadline,
}

#[derive(Clone, Debug)]
pub struct ConnectContext {
    /// The endpoint the attempt that produced this event targeted.
    pub endpoint: Option<Endpoint>,
    /// The name the endpoint was resolved from, when connecting by name.
    pub name: Option<String>,
    /// How many endpoints were attempted, including this one.
    pub attempts: usize,
    pub error: Option<Error>,
}

#[derive(Clone, Debug)]
pub struct ConnectEvent {
    pub kind: EventType,
    pub context: ConnectContext,
}

#[derive(Clone, Debug)]
pub struct BindContext {
    pub endpoint: Option<Endpoint>,
    pub error: Option<Error>,
}

#[derive(Clone, Debug)]
pub struct BindEvent {
    pub kind: EventType,
    pub context: BindContext,
}

#[derive(Clone, Debug)]
pub struct SendContext {
    /// Bytes accepted by the transport for this operation.
    pub bytes_sent: usize,
    pub queue: QueueContext,
    /// Set when the buffer went out via kernel zero-copy and the kernel has
    /// released it back.
    pub zero_copy_acknowledged: bool,
    /// Software timestamp of the final drain, when timestamping was
    /// requested.
    pub timestamp: Option<Instant>,
    pub error: Option<Error>,
}

#[derive(Clone, Debug)]
pub struct SendEvent {
    pub kind: EventType,
    pub context: SendContext,
}

#[derive(Clone, Debug)]
pub struct ReceiveContext {
    /// The delivered bytes; between the operation's `min_size` and
    /// `max_size` for streams, one whole datagram for datagram sockets.
    pub data: Vec<u8>,
    /// The source endpoint, for datagram sockets.
    pub endpoint: Option<Endpoint>,
    pub queue: QueueContext,
    /// Software timestamp of the read that completed the operation.
    pub timestamp: Option<Instant>,
    pub error: Option<Error>,
}

#[derive(Clone, Debug)]
pub struct ReceiveEvent {
    pub kind: EventType,
    pub context: ReceiveContext,
}

#[derive(Clone, Debug)]
pub struct AcceptContext {
    /// The peer endpoint of the accepted connection.
    pub endpoint: Option<Endpoint>,
    pub queue: QueueContext,
    pub error: Option<Error>,
}

#[derive(Debug)]
pub struct AcceptEvent {
    pub kind: EventType,
    pub context: AcceptContext,
    /// The accepted connection, present on `Complete`.
    pub socket: Option<crate::socket::stream::StreamSocket>,
}

/// Whether a shutdown was initiated locally or observed from the peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShutdownOrigin {
    Source,
    Remote,
}

#[derive(Clone, Debug)]
pub struct ShutdownContext {
    pub origin: ShutdownOrigin,
    /// The send direction is closed.
    pub send: bool,
    /// The receive direction is closed.
    pub receive: bool,
    pub error: Option<Error>,
}

#[derive(Clone, Debug)]
pub struct ShutdownEvent {
    pub kind: EventType,
    pub context: ShutdownContext,
}

#[derive(Clone, Debug, Default)]
pub struct UpgradeContext {
    pub error: Option<Error>,
}

#[derive(Clone, Debug)]
pub struct UpgradeEvent {
    pub kind: EventType,
    pub context: UpgradeContext,
}

#[derive(Clone, Debug)]
pub struct DowngradeContext {
    /// The send side finished its downgrade (close-notify flushed).
    pub send: bool,
    /// The receive side finished its downgrade (peer close-notify
    /// consumed).
    pub receive: bool,
    pub error: Option<Error>,
}

#[derive(Clone, Debug)]
pub struct DowngradeEvent {
    pub kind: EventType,
    pub context: DowngradeContext,
}

/// An out-of-band failure surfaced to the socket's session observer.
#[derive(Clone, Debug)]
pub struct ErrorEvent {
    pub error: Error,
}

/// A queue crossed one of its watermarks.
#[derive(Clone, Debug)]
pub struct WatermarkEvent {
    pub direction: QueueDirection,
    pub kind: WatermarkKind,
    pub context: QueueContext,
}
