//! An asynchronous network-I/O runtime.
//!
//! netio provides stream, listener, and datagram sockets, timers, name
//! resolution, and an optional TLS upgrade surface, driven by pluggable I/O
//! engines: readiness-based reactors (level- or edge-triggered polling over
//! `epoll`, `kqueue`, `poll`, or `select`) and a completion-based proactor.
//! Applications submit operations and receive results through callbacks
//! dispatched on serialized execution contexts (strands).
//!
//! # Shape
//!
//! - [`Reactor`] and [`Proactor`] implement the shared [`Driver`] engine
//!   contract: attach and detach handles, show and hide interest, schedule
//!   timers, defer functors, and block in `run` harvesting events.
//! - [`StreamSocket`], [`ListenerSocket`], and [`DatagramSocket`] are state
//!   machines over their queues, watermarks, flow control, deadlines, and
//!   detach protocol.
//! - [`Resolver`] answers name, address, service, and port lookups from an
//!   authoritative override database, a bounded TTL/LRU cache, and an
//!   iterative DNS client.
//! - [`Interface`] binds a thread pool to one engine and hands out sockets
//!   and timers running on it.
//!
//! # Example
//!
//! ```no_run
//! use netio::{Callback, Interface, InterfaceConfig};
//! use netio::socket::options::ConnectOptions;
//!
//! # fn main() -> netio::Result<()> {
//! let interface = Interface::new(InterfaceConfig::default())?;
//! let socket = interface.create_stream_socket(Default::default());
//! socket.connect(
//!     "93.184.216.34:80".parse()?,
//!     ConnectOptions::default(),
//!     Callback::new(|event| println!("connect: {:?}", event.kind)),
//! )?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_debug_implementations)]
#![allow(clippy::type_complexity)]

mod callback;
mod endpoint;
mod error;
mod event;
mod interest;
mod interface;
mod proactor;
mod queue;
mod reactor;
mod reservation;
mod strand;
mod sys;
mod timer;
mod token;

pub mod driver;
pub mod resolver;
pub mod socket;
pub mod tls;

pub use callback::{Callback, CallbackState, CancellationToken, FutureResult};
pub use driver::{Backend, Driver, DriverSocket, Handle, WaiterOptions};
pub use endpoint::{Endpoint, Transport};
pub use error::{Error, Result};
pub use event::{Event, Events};
pub use interest::Interest;
pub use interface::{Interface, InterfaceConfig};
pub use proactor::{Proactor, ProactorConfig};
pub use queue::{
    FlowControlMode, FlowControlType, QueueContext, QueueDirection, WatermarkKind,
};
pub use reactor::{Reactor, ReactorConfig};
pub use reservation::Reservation;
pub use resolver::Resolver;
pub use socket::{DatagramSocket, ListenerSocket, SocketSession, StreamSocket};
pub use strand::{Executor, Strand, Task};
pub use timer::{Timer, TimerCallback, TimerContext, TimerEvent, TimerEventType, TimerOptions};
pub use token::Token;
