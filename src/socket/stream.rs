//! The stream socket state machine.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::net::{IpAddr, Shutdown};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::callback::Callback;
use crate::driver::{Driver, DriverSocket, Handle};
use crate::endpoint::{Endpoint, Transport};
use crate::queue::{FlowControlMode, FlowControlState, FlowControlType, QueueDirection, QueueState};
use crate::reservation::Reservation;
use crate::resolver::{GetIpAddressOptions, Resolver};
use crate::socket::event::{
    BindContext, BindEvent, ConnectContext, ConnectEvent, DowngradeContext, DowngradeEvent,
    ErrorEvent, EventType, ReceiveContext, ReceiveEvent, SendContext, SendEvent, ShutdownContext,
    ShutdownEvent, ShutdownOrigin, UpgradeContext, UpgradeEvent, WatermarkEvent,
};
use crate::socket::options::{
    ConnectOptions, ConnectStrategy, ReceiveOptions, SendOptions, ShutdownMode, ShutdownType,
    SocketOptions,
};
use crate::socket::{next_socket_id, DetachState, OpenState, SocketSession, DEFAULT_WATERMARKS};
use crate::strand::Strand;
use crate::sys::net;
use crate::timer::{Timer, TimerEventType, TimerOptions};
use crate::tls::{EncryptionRole, EncryptionSession};
use crate::{Error, Interest, Result, Token};

type Dispatches = Vec<Box<dyn FnOnce() + Send>>;

fn run_dispatches(dispatches: Dispatches) {
    for dispatch in dispatches {
        dispatch();
    }
}

struct SendEntry {
    id: u64,
    data: Vec<u8>,
    written: usize,
    /// Plaintext bytes this entry accounts for in the send queue context;
    /// zero for internal (handshake) records.
    accounted: usize,
    callback: Option<Callback<SendEvent>>,
    timer: Option<Timer>,
    zero_copy: bool,
    zero_copy_seqs: Vec<u32>,
    timestamping: bool,
    recurse: bool,
}

/// A fully written zero-copy send waiting for the kernel to release its
/// buffer.
struct ZeroCopyPending {
    seqs: Vec<u32>,
    bytes: usize,
    callback: Option<Callback<SendEvent>>,
    timestamping: bool,
    recurse: bool,
}

struct ReceiveEntry {
    id: u64,
    min_size: usize,
    max_size: usize,
    callback: Option<Callback<ReceiveEvent>>,
    timer: Option<Timer>,
    recurse: bool,
}

struct PendingConnect {
    remaining: VecDeque<Endpoint>,
    current: Option<Endpoint>,
    name: Option<String>,
    attempts: usize,
    last_error: Option<Error>,
    callback: Option<Callback<ConnectEvent>>,
    timer: Option<Timer>,
    recurse: bool,
    /// The attempt is waiting for a stale handle to detach before opening a
    /// fresh one.
    awaiting_detach: bool,
}

struct EncryptionState {
    session: Box<dyn EncryptionSession>,
    established: bool,
    /// Plaintext sends submitted while the handshake is still in flight.
    pending: VecDeque<(Vec<u8>, Option<Callback<SendEvent>>, SendOptions)>,
    upgrade_callback: Option<Callback<UpgradeEvent>>,
    downgrade_callback: Option<Callback<DowngradeEvent>>,
    send_downgraded: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DetachPurpose {
    Close,
    /// The handle is being recycled for a connect failover attempt.
    Reconnect,
}

struct StreamState {
    socket: Option<socket2::Socket>,
    transport: Option<Transport>,
    token: Option<Token>,
    open: OpenState,
    detach: DetachState,
    detach_purpose: DetachPurpose,
    options: SocketOptions,
    bound: Option<Endpoint>,
    session: Option<Arc<dyn SocketSession>>,
    flow: FlowControlState,
    /// Graceful send-side flow pause finishing the head entry first.
    pausing_send: bool,

    connect: Option<PendingConnect>,

    send_queue: VecDeque<SendEntry>,
    send_state: QueueState,
    send_no_enqueue: bool,
    send_shut: bool,
    zero_copy_enabled: bool,
    zero_copy_seq: u32,
    zero_copy_acks: Vec<net::ZeroCopyRange>,
    zero_copy_pending: Vec<ZeroCopyPending>,

    receive_buffer: Vec<u8>,
    receive_queue: VecDeque<ReceiveEntry>,
    receive_state: QueueState,
    receive_eof: bool,
    receive_shut: bool,
    remote_shutdown_reported: bool,

    encryption: Option<EncryptionState>,

    shown_readable: bool,
    shown_writable: bool,
    shown_notifications: bool,

    close_callbacks: Vec<Callback<()>>,
    closing: bool,
    // The handle reservation was charged and must be released exactly once.
    reserved: bool,

    next_op_id: u64,
}

impl StreamState {
    fn new(options: SocketOptions) -> StreamState {
        let (send_low, send_high) = options.send_watermarks.unwrap_or(DEFAULT_WATERMARKS);
        let (recv_low, recv_high) = options.receive_watermarks.unwrap_or(DEFAULT_WATERMARKS);
        StreamState {
            socket: None,
            transport: None,
            token: None,
            open: OpenState::Default,
            detach: DetachState::Idle,
            detach_purpose: DetachPurpose::Close,
            options,
            bound: None,
            session: None,
            flow: FlowControlState::new(),
            pausing_send: false,
            connect: None,
            send_queue: VecDeque::new(),
            send_state: QueueState::new(send_low, send_high),
            send_no_enqueue: false,
            send_shut: false,
            zero_copy_enabled: false,
            zero_copy_seq: 0,
            zero_copy_acks: Vec::new(),
            zero_copy_pending: Vec::new(),
            receive_buffer: Vec::new(),
            receive_queue: VecDeque::new(),
            receive_state: QueueState::new(recv_low, recv_high),
            receive_eof: false,
            receive_shut: false,
            remote_shutdown_reported: false,
            encryption: None,
            shown_readable: false,
            shown_writable: false,
            shown_notifications: false,
            close_callbacks: Vec::new(),
            closing: false,
            reserved: false,
            next_op_id: 1,
        }
    }

    fn op_id(&mut self) -> u64 {
        let id = self.next_op_id;
        self.next_op_id += 1;
        id
    }
}

pub(crate) struct StreamInner {
    id: u64,
    driver: Arc<dyn Driver>,
    strand: Arc<Strand>,
    resolver: Mutex<Option<Arc<Resolver>>>,
    reservation: Mutex<Option<Arc<Reservation>>>,
    // Mirrors the owned handle so the engine can read it without the state
    // mutex.
    fd: AtomicI32,
    state: Mutex<StreamState>,
    weak: Weak<StreamInner>,
}

/// An asynchronous stream (connection-oriented) socket.
///
/// Operations are submitted from any thread; completions are dispatched on
/// the socket's strand, serialized with respect to one another.
#[derive(Clone)]
pub struct StreamSocket {
    inner: Arc<StreamInner>,
}

impl StreamSocket {
    pub fn new(driver: Arc<dyn Driver>) -> StreamSocket {
        StreamSocket::with_options(driver, SocketOptions::default())
    }

    pub fn with_options(driver: Arc<dyn Driver>, options: SocketOptions) -> StreamSocket {
        let strand = driver.new_strand();
        let inner = Arc::new_cyclic(|weak| StreamInner {
            id: next_socket_id(),
            driver,
            strand,
            resolver: Mutex::new(None),
            reservation: Mutex::new(None),
            fd: AtomicI32::new(-1),
            state: Mutex::new(StreamState::new(options)),
            weak: weak.clone(),
        });
        StreamSocket { inner }
    }

    /// Wraps a connected handle produced by a listener.
    pub(crate) fn from_accepted(
        driver: Arc<dyn Driver>,
        socket: socket2::Socket,
        transport: Transport,
        reservation: Option<Arc<Reservation>>,
        options: SocketOptions,
    ) -> Result<StreamSocket> {
        let wrapped = StreamSocket::with_options(driver, options);
        let charged = reservation.is_some();
        *wrapped.inner.reservation.lock() = reservation;
        let mut state = wrapped.inner.state.lock();
        state.reserved = charged;
        wrapped
            .inner
            .fd
            .store(socket.as_raw_fd_i32(), Ordering::SeqCst);
        state.socket = Some(socket);
        state.transport = Some(transport);
        state.open = OpenState::Connected;
        // Start pulling incoming bytes into the receive queue right away.
        wrapped.inner.sync_interest(&mut state)?;
        drop(state);
        Ok(wrapped)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn strand(&self) -> Arc<Strand> {
        Arc::clone(&self.inner.strand)
    }

    /// Installs the out-of-band observer. Its methods run on the socket's
    /// strand.
    pub fn set_session(&self, session: Arc<dyn SocketSession>) {
        self.inner.state.lock().session = Some(session);
    }

    /// Supplies the resolver used by [`StreamSocket::connect_name`].
    pub fn set_resolver(&self, resolver: Arc<Resolver>) {
        *self.inner.resolver.lock() = Some(resolver);
    }

    /// Attaches a handle-count reservation charged by `open`.
    pub fn set_reservation(&self, reservation: Arc<Reservation>) {
        *self.inner.reservation.lock() = Some(reservation);
    }

    /// Allocates the handle and moves the socket to `waiting`.
    pub fn open(&self, transport: Transport) -> Result<()> {
        self.inner.open(transport)
    }

    /// Binds the handle to `endpoint`, reporting the outcome as a
    /// `BindEvent` as well.
    pub fn bind(&self, endpoint: &Endpoint) -> Result<BindEvent> {
        self.inner.bind(endpoint)
    }

    /// The transport the handle was opened over, once open.
    pub fn transport(&self) -> Option<Transport> {
        self.inner.state.lock().transport
    }

    pub fn local_endpoint(&self) -> Result<Endpoint> {
        let state = self.inner.state.lock();
        let socket = state.socket.as_ref().ok_or(Error::Invalid)?;
        net::local_endpoint(socket).map_err(Error::from)
    }

    pub fn peer_endpoint(&self) -> Result<Endpoint> {
        let state = self.inner.state.lock();
        let socket = state.socket.as_ref().ok_or(Error::Invalid)?;
        net::peer_endpoint(socket).map_err(Error::from)
    }

    /// Connects to an endpoint. The callback observes the terminal
    /// `ConnectEvent`.
    pub fn connect(
        &self,
        endpoint: Endpoint,
        options: ConnectOptions,
        callback: Callback<ConnectEvent>,
    ) -> Result<()> {
        self.inner
            .start_connect(vec![endpoint], None, options, callback)
            .map_err(|(error, _callback)| error)
    }

    /// Resolves `name` and connects per the configured strategy:
    /// `ResolveIntoSingle` attempts the first address, `ResolveIntoList`
    /// fails over across all of them in order.
    pub fn connect_name(
        &self,
        name: &str,
        port: u16,
        options: ConnectOptions,
        callback: Callback<ConnectEvent>,
    ) -> Result<()> {
        let resolver = self
            .inner
            .resolver
            .lock()
            .clone()
            .ok_or(Error::Invalid)?;
        let inner = Weak::clone(&self.inner.weak);
        let name_owned = name.to_string();
        let strategy = options.strategy;
        let continuation = Callback::new(move |result: Result<Vec<IpAddr>>| {
            let inner = match inner.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            match result {
                Ok(addrs) if !addrs.is_empty() => {
                    let mut endpoints: Vec<Endpoint> =
                        addrs.into_iter().map(|ip| Endpoint::ip(ip, port)).collect();
                    if strategy == ConnectStrategy::ResolveIntoSingle {
                        endpoints.truncate(1);
                    }
                    let name = name_owned.clone();
                    if let Err((error, callback)) =
                        inner.start_connect(endpoints, Some(name), options.clone(), callback)
                    {
                        // The state changed while resolving (e.g. closed);
                        // the submitted callback still observes an outcome.
                        callback.fire(
                            connect_event(
                                EventType::Error,
                                None,
                                Some(name_owned.clone()),
                                0,
                                Some(error),
                            ),
                            None,
                            true,
                        );
                    }
                }
                Ok(_) => {
                    callback.fire(
                        connect_event(EventType::Error, None, Some(name_owned.clone()), 0, Some(Error::Unreachable)),
                        None,
                        true,
                    );
                }
                Err(error) => {
                    callback.fire(
                        connect_event(EventType::Error, None, Some(name_owned.clone()), 0, Some(error)),
                        None,
                        true,
                    );
                }
            }
        })
        .with_strand(Arc::clone(&self.inner.strand));
        resolver.get_ip_address(name, GetIpAddressOptions::default(), continuation);
        Ok(())
    }

    /// Enqueues `data` for transmission. Fails immediately with
    /// `Error::WouldBlock` when the send queue is over its high watermark
    /// and the options do not force the enqueue.
    pub fn send(
        &self,
        data: Vec<u8>,
        options: SendOptions,
        callback: Option<Callback<SendEvent>>,
    ) -> Result<()> {
        self.inner.send(data, options, callback)
    }

    /// Posts a receive satisfied once at least `min_size` bytes are
    /// available, the peer shut down, the deadline fires, or the operation
    /// is canceled.
    pub fn receive(&self, options: ReceiveOptions, callback: Callback<ReceiveEvent>) -> Result<()> {
        self.inner.receive(options, callback)
    }

    /// Closes one or both directions.
    pub fn shutdown(&self, which: ShutdownType, mode: ShutdownMode) -> Result<()> {
        self.inner.shutdown(which, mode)
    }

    /// Pauses or resumes a direction. Orthogonal to shutdown: the queues
    /// are preserved, only readiness interest changes.
    pub fn apply_flow_control(
        &self,
        which: FlowControlType,
        mode: FlowControlMode,
        enable: bool,
    ) -> Result<()> {
        self.inner.apply_flow_control(which, mode, enable)
    }

    /// Redirects the data plane through `session` and begins the
    /// handshake. The callback observes the terminal upgrade event;
    /// `Initiated` is reported to the session observer.
    pub fn upgrade(
        &self,
        session: Box<dyn EncryptionSession>,
        role: EncryptionRole,
        callback: Callback<UpgradeEvent>,
    ) -> Result<()> {
        self.inner.upgrade(session, role, callback)
    }

    /// Flushes the close-notify and re-exposes the raw stream once the
    /// peer's close-notify is consumed.
    pub fn downgrade(&self, callback: Callback<DowngradeEvent>) -> Result<()> {
        self.inner.downgrade(callback)
    }

    /// Begins detach, cancels pending operations with `Cancelled`, releases
    /// the handle, then invokes `callback` on the socket's strand. Close is
    /// idempotent: a second close's callback still fires.
    pub fn close(&self, callback: Option<Callback<()>>) {
        self.inner.close(callback)
    }
}

impl std::fmt::Debug for StreamSocket {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        fmt.debug_struct("StreamSocket")
            .field("id", &self.inner.id)
            .field("open", &state.open)
            .field("send_queue", &state.send_state.size())
            .field("receive_queue", &state.receive_state.size())
            .finish()
    }
}

fn connect_event(
    kind: EventType,
    endpoint: Option<Endpoint>,
    name: Option<String>,
    attempts: usize,
    error: Option<Error>,
) -> ConnectEvent {
    ConnectEvent {
        kind,
        context: ConnectContext {
            endpoint,
            name,
            attempts,
            error,
        },
    }
}

impl StreamInner {
    fn observe(
        &self,
        state: &StreamState,
        dispatches: &mut Dispatches,
        f: impl FnOnce(&dyn SocketSession) + Send + 'static,
    ) {
        if let Some(session) = state.session.clone() {
            let strand = Arc::clone(&self.strand);
            dispatches.push(Box::new(move || {
                strand.execute(Box::new(move || f(session.as_ref())));
            }));
        }
    }

    fn arc(&self) -> Arc<StreamInner> {
        // The inner is only reachable through its Arc.
        self.weak.upgrade().expect("stream inner already released")
    }

    fn open(&self, transport: Transport) -> Result<()> {
        let mut state = self.state.lock();
        if state.open != OpenState::Default {
            return Err(Error::Invalid);
        }
        if !transport.is_stream() {
            return Err(Error::Invalid);
        }
        let reservation = self.reservation.lock().clone();
        if let Some(reservation) = &reservation {
            if !reservation.acquire() {
                return Err(Error::Limit);
            }
        }
        let socket = match net::open(transport) {
            Ok(socket) => socket,
            Err(err) => {
                if let Some(reservation) = &reservation {
                    reservation.release();
                }
                return Err(Error::from(err));
            }
        };
        apply_options(&socket, &state.options);
        self.fd.store(socket.as_raw_fd_i32(), Ordering::SeqCst);
        state.reserved = reservation.is_some();
        state.socket = Some(socket);
        state.transport = Some(transport);
        state.open = OpenState::Waiting;
        debug!("stream {} opened over {}", self.id, transport);
        Ok(())
    }

    fn bind(&self, endpoint: &Endpoint) -> Result<BindEvent> {
        let mut state = self.state.lock();
        if state.open == OpenState::Default {
            drop(state);
            self.open(endpoint.stream_transport())?;
            state = self.state.lock();
        }
        if state.open != OpenState::Waiting {
            return Err(Error::Invalid);
        }
        let socket = state.socket.as_ref().ok_or(Error::Invalid)?;
        match net::bind(socket, endpoint) {
            Ok(()) => {
                let local = net::local_endpoint(socket).ok();
                state.bound = Some(endpoint.clone());
                Ok(BindEvent {
                    kind: EventType::Complete,
                    context: BindContext {
                        endpoint: local,
                        error: None,
                    },
                })
            }
            Err(err) => {
                let error = Error::from(err);
                Err(error)
            }
        }
    }

    /// Validates and records the connect; on rejection the callback is
    /// handed back so asynchronous submitters can still fail it.
    fn start_connect(
        &self,
        endpoints: Vec<Endpoint>,
        name: Option<String>,
        options: ConnectOptions,
        callback: Callback<ConnectEvent>,
    ) -> std::result::Result<(), (Error, Callback<ConnectEvent>)> {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if state.closing || state.open == OpenState::Closed {
                return Err((Error::Invalid, callback));
            }
            if state.connect.is_some() || state.open == OpenState::Connected {
                return Err((Error::Invalid, callback));
            }
            if endpoints.is_empty() {
                return Err((Error::AddressMalformed, callback));
            }

            let mut pending = PendingConnect {
                remaining: endpoints.into_iter().collect(),
                current: None,
                name,
                attempts: 0,
                last_error: None,
                callback: Some(callback),
                timer: None,
                recurse: options.recurse,
                awaiting_detach: false,
            };

            // The whole operation shares one deadline.
            if let Some(deadline) = options.deadline {
                let weak = Weak::clone(&self.weak);
                let session: crate::timer::TimerCallback = Arc::new(move |event| {
                    if event.kind != TimerEventType::Deadline {
                        return;
                    }
                    if let Some(inner) = weak.upgrade() {
                        inner.connect_deadline();
                    }
                });
                let mut timer_options = TimerOptions::once(deadline);
                timer_options.strand = Some(Arc::clone(&self.strand));
                pending.timer = self.driver.add_timer(timer_options, session).ok();
            }

            // Cancellation removes the pending connect and reports it.
            if let Some(cb) = pending.callback.as_ref() {
                let weak = Weak::clone(&self.weak);
                cb.set_cancel_hook(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.connect_cancelled();
                    }
                });
            }

            state.connect = Some(pending);
            state.open = OpenState::Connecting;
            self.attempt_connect(&mut state, &mut dispatches);
        }
        run_dispatches(dispatches);
        Ok(())
    }

    /// Tries endpoints from the pending list until one is in flight,
    /// succeeds, or the list is exhausted. Holds the state lock.
    fn attempt_connect(&self, state: &mut StreamState, dispatches: &mut Dispatches) {
        loop {
            let pending = match state.connect.as_mut() {
                Some(pending) => pending,
                None => return,
            };
            if pending.awaiting_detach {
                return;
            }
            let endpoint = match pending.remaining.pop_front() {
                Some(endpoint) => endpoint,
                None => {
                    let error = pending.last_error.unwrap_or(Error::Unreachable);
                    self.finish_connect_error(state, dispatches, error);
                    return;
                }
            };
            pending.attempts += 1;
            pending.current = Some(endpoint.clone());
            let attempts = pending.attempts;
            trace!(
                "stream {} connect attempt {} to {}",
                self.id,
                attempts,
                endpoint
            );

            if state.socket.is_none() {
                let transport = endpoint.stream_transport();
                match net::open(transport) {
                    Ok(socket) => {
                        apply_options(&socket, &state.options);
                        if let Some(bound) = state.bound.clone() {
                            let _ = net::bind(&socket, &bound);
                        }
                        self.fd.store(socket.as_raw_fd_i32(), Ordering::SeqCst);
                        state.socket = Some(socket);
                        state.transport = Some(transport);
                    }
                    Err(err) => {
                        let pending = state.connect.as_mut().unwrap();
                        pending.last_error = Some(Error::from(err));
                        continue;
                    }
                }
            }

            let socket = state.socket.as_ref().unwrap();
            match net::connect(socket, &endpoint) {
                Ok(true) => {
                    self.finish_connect_success(state, dispatches);
                    return;
                }
                Ok(false) => {
                    if self.ensure_attached(state).is_err() {
                        let pending = state.connect.as_mut().unwrap();
                        pending.last_error = Some(Error::Invalid);
                        continue;
                    }
                    if let Err(error) = self.sync_interest(state) {
                        let pending = state.connect.as_mut().unwrap();
                        pending.last_error = Some(error);
                        continue;
                    }
                    return;
                }
                Err(err) => {
                    let error = Error::from(err);
                    let pending = state.connect.as_mut().unwrap();
                    pending.last_error = Some(error);
                    // The handle was not attached yet for this attempt, so
                    // it can be replaced directly.
                    if state.token.is_none() {
                        self.fd.store(-1, Ordering::SeqCst);
                        state.socket = None;
                        state.transport = None;
                    } else {
                        self.recycle_handle(state, dispatches);
                        return;
                    }
                }
            }
        }
    }

    /// Releases a poisoned handle through the detach protocol and resumes
    /// the connect attempts once the engine confirms. Holds the state lock;
    /// the detach request itself is deferred past the unlock because an
    /// idle engine completes detaches on the calling thread.
    fn recycle_handle(&self, state: &mut StreamState, dispatches: &mut Dispatches) {
        state.detach_purpose = DetachPurpose::Reconnect;
        if let Some(pending) = state.connect.as_mut() {
            pending.awaiting_detach = true;
        }
        self.fd.store(-1, Ordering::SeqCst);
        state.socket = None;
        state.shown_readable = false;
        state.shown_writable = false;
        state.shown_notifications = false;
        if let Some(token) = state.token.take() {
            state.detach = DetachState::Initiated;
            let driver = Arc::clone(&self.driver);
            dispatches.push(Box::new(move || {
                let _ = driver.detach(token);
            }));
        } else if let Some(pending) = state.connect.as_mut() {
            pending.awaiting_detach = false;
        }
    }

    fn finish_connect_success(&self, state: &mut StreamState, dispatches: &mut Dispatches) {
        let pending = match state.connect.take() {
            Some(pending) => pending,
            None => return,
        };
        if let Some(timer) = &pending.timer {
            timer.cancel();
        }
        state.open = OpenState::Connected;
        let endpoint = pending.current.clone();
        debug!(
            "stream {} connected to {}",
            self.id,
            endpoint
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "?".into())
        );
        if let Some(callback) = pending.callback {
            callback.clear_cancel_hook();
            let event = connect_event(
                EventType::Complete,
                endpoint,
                pending.name,
                pending.attempts,
                None,
            );
            let strand = Arc::clone(&self.strand);
            let defer = !pending.recurse;
            dispatches.push(Box::new(move || {
                callback.complete_or(
                    event,
                    connect_event(EventType::Canceled, None, None, 0, Some(Error::Cancelled)),
                    Some(&strand),
                    defer,
                );
            }));
        }
        // Sends may have been queued while connecting.
        self.drain_send_queue(state, dispatches);
        let _ = self.sync_interest(state);
    }

    fn finish_connect_error(
        &self,
        state: &mut StreamState,
        dispatches: &mut Dispatches,
        error: Error,
    ) {
        let pending = match state.connect.take() {
            Some(pending) => pending,
            None => return,
        };
        if let Some(timer) = &pending.timer {
            timer.cancel();
        }
        if state.open == OpenState::Connecting {
            state.open = OpenState::Waiting;
        }
        warn!("stream {} connect failed: {}", self.id, error);
        if let Some(callback) = pending.callback {
            callback.clear_cancel_hook();
            let event = connect_event(
                EventType::Error,
                pending.current,
                pending.name,
                pending.attempts,
                Some(error),
            );
            let strand = Arc::clone(&self.strand);
            let defer = !pending.recurse;
            dispatches.push(Box::new(move || {
                callback.complete_or(
                    event,
                    connect_event(EventType::Canceled, None, None, 0, Some(Error::Cancelled)),
                    Some(&strand),
                    defer,
                );
            }));
        }
        let _ = self.sync_interest(state);
    }

    /// Deadline expiry for the in-flight connect.
    fn connect_deadline(&self) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if state.connect.is_some() {
                self.finish_connect_error(&mut state, &mut dispatches, Error::WouldBlockConnect);
            }
        }
        run_dispatches(dispatches);
    }

    /// Accepted abort of the in-flight connect.
    fn connect_cancelled(&self) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            let pending = match state.connect.take() {
                Some(pending) => pending,
                None => return,
            };
            if let Some(timer) = &pending.timer {
                timer.cancel();
            }
            if state.open == OpenState::Connecting {
                state.open = OpenState::Waiting;
            }
            if let Some(callback) = pending.callback {
                let event = connect_event(
                    EventType::Canceled,
                    pending.current,
                    pending.name,
                    pending.attempts,
                    Some(Error::Cancelled),
                );
                let strand = Arc::clone(&self.strand);
                dispatches.push(Box::new(move || {
                    callback.fire(event, Some(&strand), true);
                }));
            }
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
    }

    fn send(
        &self,
        data: Vec<u8>,
        options: SendOptions,
        callback: Option<Callback<SendEvent>>,
    ) -> Result<()> {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if state.closing || state.open == OpenState::Closed {
                return Err(Error::Invalid);
            }
            if state.send_no_enqueue || state.send_shut {
                return Err(Error::ConnectionDead);
            }
            if !matches!(state.open, OpenState::Connecting | OpenState::Connected) {
                return Err(Error::Invalid);
            }
            if state.send_state.is_over_high() && !options.force {
                return Err(Error::WouldBlock);
            }

            // While an upgrade handshake is in flight, plaintext waits
            // behind it.
            if let Some(encryption) = state.encryption.as_mut() {
                if !encryption.established {
                    encryption.pending.push_back((data, callback, options));
                    return Ok(());
                }
            }

            self.enqueue_send(&mut state, data, options, callback, &mut dispatches);
            if state.open == OpenState::Connected {
                self.drain_send_queue(&mut state, &mut dispatches);
            }
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
        Ok(())
    }

    /// Wraps (when encrypted) and queues one send. Holds the state lock.
    /// Wrap failures surface through the callback, never silently.
    fn enqueue_send(
        &self,
        state: &mut StreamState,
        data: Vec<u8>,
        options: SendOptions,
        callback: Option<Callback<SendEvent>>,
        dispatches: &mut Dispatches,
    ) {
        let accounted = data.len();
        let wrapped = match state.encryption.as_mut() {
            Some(encryption) if encryption.established && !encryption.send_downgraded => {
                encryption.session.wrap(&data).map(Some)
            }
            _ => Ok(None),
        };
        let payload = match wrapped {
            Ok(Some(ciphertext)) => ciphertext,
            Ok(None) => data,
            Err(error) => {
                if let Some(callback) = callback {
                    let queue = state.send_state.context();
                    let strand = Arc::clone(&self.strand);
                    dispatches.push(Box::new(move || {
                        let event = SendEvent {
                            kind: EventType::Error,
                            context: SendContext {
                                bytes_sent: 0,
                                queue,
                                zero_copy_acknowledged: false,
                                timestamp: None,
                                error: Some(error),
                            },
                        };
                        callback.fire(event, Some(&strand), true);
                    }));
                }
                return;
            }
        };

        if options.zero_copy && !state.zero_copy_enabled {
            if let Some(socket) = state.socket.as_ref() {
                if net::set_zero_copy(socket).is_ok() {
                    state.zero_copy_enabled = true;
                }
            }
        }
        let zero_copy = options.zero_copy && state.zero_copy_enabled;

        let id = state.op_id();
        let mut entry = SendEntry {
            id,
            data: payload,
            written: 0,
            accounted,
            callback,
            timer: None,
            zero_copy,
            zero_copy_seqs: Vec::new(),
            timestamping: options.timestamping,
            recurse: options.recurse,
        };

        if let Some(deadline) = options.deadline {
            let weak = Weak::clone(&self.weak);
            let session: crate::timer::TimerCallback = Arc::new(move |event| {
                if event.kind != TimerEventType::Deadline {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.send_deadline(id);
                }
            });
            let mut timer_options = TimerOptions::once(deadline);
            timer_options.strand = Some(Arc::clone(&self.strand));
            entry.timer = self.driver.add_timer(timer_options, session).ok();
        }

        if let Some(cb) = entry.callback.as_ref() {
            let weak = Weak::clone(&self.weak);
            cb.set_cancel_hook(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.send_cancelled(id);
                }
            });
        }

        if let Some(crossing) = state.send_state.add(entry.accounted) {
            let context = state.send_state.context();
            self.observe(state, dispatches, move |session| {
                session.on_watermark(WatermarkEvent {
                    direction: QueueDirection::Send,
                    kind: crossing,
                    context,
                });
            });
        }
        state.send_queue.push_back(entry);
    }

    /// Queues internal (handshake) records ahead of watermark accounting.
    fn enqueue_raw_send(&self, state: &mut StreamState, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let id = state.op_id();
        state.send_queue.push_back(SendEntry {
            id,
            data,
            written: 0,
            accounted: 0,
            callback: None,
            timer: None,
            zero_copy: false,
            zero_copy_seqs: Vec::new(),
            timestamping: false,
            recurse: false,
        });
    }

    /// Writes from the queue head until `WouldBlock` or empty. Holds the
    /// state lock; completions are collected into `dispatches`.
    fn drain_send_queue(&self, state: &mut StreamState, dispatches: &mut Dispatches) {
        if state.open != OpenState::Connected || !state.flow.enable_send || state.send_shut {
            return;
        }
        loop {
            let fd = match state.socket.as_ref() {
                Some(socket) => socket.as_raw_fd_i32(),
                None => return,
            };
            let entry = match state.send_queue.front_mut() {
                Some(entry) => entry,
                None => break,
            };
            let zero_copy = entry.zero_copy;
            let bufs = [IoSlice::new(&entry.data[entry.written..])];
            match net::send_vectored(fd, &bufs, zero_copy) {
                Ok(n) => {
                    entry.written += n;
                    if zero_copy {
                        state.zero_copy_seq = state.zero_copy_seq.wrapping_add(1);
                        let seq = state.zero_copy_seq.wrapping_sub(1);
                        entry.zero_copy_seqs.push(seq);
                    }
                    if entry.written == entry.data.len() {
                        let entry = state.send_queue.pop_front().unwrap();
                        self.complete_send_entry(state, entry, dispatches);
                        if state.pausing_send {
                            state.pausing_send = false;
                            state.flow.enable_send = false;
                            break;
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if zero_copy && err.raw_os_error() == Some(libc::ENOBUFS) => {
                    // The kernel's optmem quota for zero-copy is exhausted;
                    // fall back to a plain copy for this entry.
                    entry.zero_copy = false;
                }
                Err(err) => {
                    let error = Error::from(err);
                    let entry = state.send_queue.pop_front().unwrap();
                    self.fail_send_entry(state, entry, error, dispatches);
                    self.observe(state, dispatches, move |session| {
                        session.on_error(ErrorEvent { error });
                    });
                    break;
                }
            }
        }

        // A graceful send shutdown completes once the queue drains.
        if state.send_queue.is_empty() && state.send_no_enqueue && !state.send_shut {
            self.finish_send_shutdown(state, dispatches, ShutdownOrigin::Source, None);
        }
    }

    fn complete_send_entry(
        &self,
        state: &mut StreamState,
        mut entry: SendEntry,
        dispatches: &mut Dispatches,
    ) {
        if let Some(timer) = entry.timer.take() {
            timer.cancel();
        }
        if let Some(crossing) = state.send_state.remove(entry.accounted) {
            let context = state.send_state.context();
            self.observe(state, dispatches, move |session| {
                session.on_watermark(WatermarkEvent {
                    direction: QueueDirection::Send,
                    kind: crossing,
                    context,
                });
            });
        }

        // A zero-copy entry completes once the kernel releases the buffer.
        if entry.zero_copy && !entry.zero_copy_seqs.is_empty() {
            state.zero_copy_pending.push(ZeroCopyPending {
                seqs: std::mem::take(&mut entry.zero_copy_seqs),
                bytes: entry.accounted,
                callback: entry.callback.take(),
                timestamping: entry.timestamping,
                recurse: entry.recurse,
            });
            self.settle_zero_copy(state, dispatches);
            return;
        }

        if let Some(callback) = entry.callback.take() {
            callback.clear_cancel_hook();
            let queue = state.send_state.context();
            let bytes = entry.accounted;
            let timestamp = entry.timestamping.then(Instant::now);
            let strand = Arc::clone(&self.strand);
            let defer = !entry.recurse;
            dispatches.push(Box::new(move || {
                let event = SendEvent {
                    kind: EventType::Complete,
                    context: SendContext {
                        bytes_sent: bytes,
                        queue,
                        zero_copy_acknowledged: false,
                        timestamp,
                        error: None,
                    },
                };
                let cancelled = SendEvent {
                    kind: EventType::Canceled,
                    context: SendContext {
                        bytes_sent: bytes,
                        queue,
                        zero_copy_acknowledged: false,
                        timestamp: None,
                        error: Some(Error::Cancelled),
                    },
                };
                callback.complete_or(event, cancelled, Some(&strand), defer);
            }));
        }
    }

    fn fail_send_entry(
        &self,
        state: &mut StreamState,
        mut entry: SendEntry,
        error: Error,
        dispatches: &mut Dispatches,
    ) {
        if let Some(timer) = entry.timer.take() {
            timer.cancel();
        }
        if let Some(crossing) = state.send_state.remove(entry.accounted) {
            let context = state.send_state.context();
            self.observe(state, dispatches, move |session| {
                session.on_watermark(WatermarkEvent {
                    direction: QueueDirection::Send,
                    kind: crossing,
                    context,
                });
            });
        }
        if let Some(callback) = entry.callback.take() {
            callback.clear_cancel_hook();
            let queue = state.send_state.context();
            let strand = Arc::clone(&self.strand);
            dispatches.push(Box::new(move || {
                let event = SendEvent {
                    kind: EventType::Error,
                    context: SendContext {
                        bytes_sent: 0,
                        queue,
                        zero_copy_acknowledged: false,
                        timestamp: None,
                        error: Some(error),
                    },
                };
                callback.fire(event, Some(&strand), true);
            }));
        }
    }

    /// Completes zero-copy sends whose sequence ranges the kernel has
    /// acknowledged. Holds the state lock.
    fn settle_zero_copy(&self, state: &mut StreamState, dispatches: &mut Dispatches) {
        let acks = state.zero_copy_acks.clone();
        let mut index = 0;
        while index < state.zero_copy_pending.len() {
            let done = state.zero_copy_pending[index]
                .seqs
                .iter()
                .all(|seq| acks.iter().any(|range| range.from <= *seq && *seq <= range.to));
            if !done {
                index += 1;
                continue;
            }
            let pending = state.zero_copy_pending.swap_remove(index);
            if let Some(callback) = pending.callback {
                callback.clear_cancel_hook();
                let queue = state.send_state.context();
                let strand = Arc::clone(&self.strand);
                let timestamp = pending.timestamping.then(Instant::now);
                let bytes = pending.bytes;
                let defer = !pending.recurse;
                dispatches.push(Box::new(move || {
                    let event = SendEvent {
                        kind: EventType::Complete,
                        context: SendContext {
                            bytes_sent: bytes,
                            queue,
                            zero_copy_acknowledged: true,
                            timestamp,
                            error: None,
                        },
                    };
                    let cancelled = SendEvent {
                        kind: EventType::Canceled,
                        context: SendContext {
                            bytes_sent: bytes,
                            queue,
                            zero_copy_acknowledged: true,
                            timestamp: None,
                            error: Some(Error::Cancelled),
                        },
                    };
                    callback.complete_or(event, cancelled, Some(&strand), defer);
                }));
            }
        }
    }

    /// Send deadline: the callback observes `WouldBlockSend`; the bytes
    /// stay queued.
    fn send_deadline(&self, id: u64) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            let entry = state.send_queue.iter_mut().find(|entry| entry.id == id);
            if let Some(entry) = entry {
                entry.timer = None;
                if let Some(callback) = entry.callback.take() {
                    callback.clear_cancel_hook();
                    let queue = state.send_state.context();
                    let strand = Arc::clone(&self.strand);
                    dispatches.push(Box::new(move || {
                        let event = SendEvent {
                            kind: EventType::Deadline,
                            context: SendContext {
                                bytes_sent: 0,
                                queue,
                                zero_copy_acknowledged: false,
                                timestamp: None,
                                error: Some(Error::WouldBlockSend),
                            },
                        };
                        callback.fire(event, Some(&strand), true);
                    }));
                }
            }
        }
        run_dispatches(dispatches);
    }

    /// Accepted abort of a queued send: the entry and its bytes leave the
    /// queue.
    fn send_cancelled(&self, id: u64) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            let position = state.send_queue.iter().position(|entry| entry.id == id);
            if let Some(position) = position {
                // A partially written head entry cannot be withdrawn from
                // the stream without corrupting it.
                if position == 0 && state.send_queue[0].written > 0 {
                    return;
                }
                let entry = state.send_queue.remove(position).unwrap();
                self.cancel_send_entry(&mut state, entry, &mut dispatches);
                let _ = self.sync_interest(&mut state);
            }
        }
        run_dispatches(dispatches);
    }

    fn cancel_send_entry(
        &self,
        state: &mut StreamState,
        mut entry: SendEntry,
        dispatches: &mut Dispatches,
    ) {
        if let Some(timer) = entry.timer.take() {
            timer.cancel();
        }
        if let Some(crossing) = state.send_state.remove(entry.accounted) {
            let context = state.send_state.context();
            self.observe(state, dispatches, move |session| {
                session.on_watermark(WatermarkEvent {
                    direction: QueueDirection::Send,
                    kind: crossing,
                    context,
                });
            });
        }
        if let Some(callback) = entry.callback.take() {
            let queue = state.send_state.context();
            let strand = Arc::clone(&self.strand);
            dispatches.push(Box::new(move || {
                let event = SendEvent {
                    kind: EventType::Canceled,
                    context: SendContext {
                        bytes_sent: 0,
                        queue,
                        zero_copy_acknowledged: false,
                        timestamp: None,
                        error: Some(Error::Cancelled),
                    },
                };
                callback.fire(event, Some(&strand), true);
            }));
        }
    }

    fn receive(&self, options: ReceiveOptions, callback: Callback<ReceiveEvent>) -> Result<()> {
        if options.min_size == 0 || options.max_size < options.min_size {
            return Err(Error::Invalid);
        }
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if state.closing || state.open == OpenState::Closed {
                return Err(Error::Invalid);
            }
            if state.receive_shut {
                return Err(Error::ConnectionDead);
            }

            let id = state.op_id();
            let mut entry = ReceiveEntry {
                id,
                min_size: options.min_size,
                max_size: options.max_size,
                callback: Some(callback),
                timer: None,
                recurse: options.recurse,
            };

            if let Some(deadline) = options.deadline {
                let weak = Weak::clone(&self.weak);
                let session: crate::timer::TimerCallback = Arc::new(move |event| {
                    if event.kind != TimerEventType::Deadline {
                        return;
                    }
                    if let Some(inner) = weak.upgrade() {
                        inner.receive_deadline(id);
                    }
                });
                let mut timer_options = TimerOptions::once(deadline);
                timer_options.strand = Some(Arc::clone(&self.strand));
                entry.timer = self.driver.add_timer(timer_options, session).ok();
            }

            if let Some(cb) = entry.callback.as_ref() {
                let weak = Weak::clone(&self.weak);
                cb.set_cancel_hook(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.receive_cancelled(id);
                    }
                });
            }

            state.receive_queue.push_back(entry);
            self.satisfy_receives(&mut state, &mut dispatches);
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
        Ok(())
    }

    /// Delivers buffered bytes to pending receives in order. Holds the
    /// state lock.
    fn satisfy_receives(&self, state: &mut StreamState, dispatches: &mut Dispatches) {
        loop {
            let available = state.receive_buffer.len();
            let (deliver, eof) = match state.receive_queue.front() {
                Some(entry) => {
                    if available >= entry.min_size {
                        (available.min(entry.max_size), false)
                    } else if state.receive_eof || state.receive_shut {
                        (available.min(entry.max_size), true)
                    } else {
                        break;
                    }
                }
                None => break,
            };

            let mut entry = state.receive_queue.pop_front().unwrap();
            if let Some(timer) = entry.timer.take() {
                timer.cancel();
            }
            let callback = match entry.callback.take() {
                Some(callback) => callback,
                None => continue,
            };
            callback.clear_cancel_hook();

            if deliver == 0 && eof {
                let queue = state.receive_state.context();
                let strand = Arc::clone(&self.strand);
                dispatches.push(Box::new(move || {
                    let event = ReceiveEvent {
                        kind: EventType::Error,
                        context: ReceiveContext {
                            data: Vec::new(),
                            endpoint: None,
                            queue,
                            timestamp: None,
                            error: Some(Error::Eof),
                        },
                    };
                    callback.fire(event, Some(&strand), true);
                }));
                continue;
            }

            let data: Vec<u8> = state.receive_buffer.drain(..deliver).collect();
            if let Some(crossing) = state.receive_state.remove(deliver) {
                let context = state.receive_state.context();
                self.observe(state, dispatches, move |session| {
                    session.on_watermark(WatermarkEvent {
                        direction: QueueDirection::Receive,
                        kind: crossing,
                        context,
                    });
                });
            }
            let queue = state.receive_state.context();
            let strand = Arc::clone(&self.strand);
            let defer = !entry.recurse;
            dispatches.push(Box::new(move || {
                let event = ReceiveEvent {
                    kind: EventType::Complete,
                    context: ReceiveContext {
                        data,
                        endpoint: None,
                        queue,
                        timestamp: Some(Instant::now()),
                        error: None,
                    },
                };
                let cancelled = ReceiveEvent {
                    kind: EventType::Canceled,
                    context: ReceiveContext {
                        data: Vec::new(),
                        endpoint: None,
                        queue,
                        timestamp: None,
                        error: Some(Error::Cancelled),
                    },
                };
                callback.complete_or(event, cancelled, Some(&strand), defer);
            }));
        }
    }

    fn receive_deadline(&self, id: u64) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            let position = state.receive_queue.iter().position(|entry| entry.id == id);
            if let Some(position) = position {
                let mut entry = state.receive_queue.remove(position).unwrap();
                entry.timer = None;
                if let Some(callback) = entry.callback.take() {
                    callback.clear_cancel_hook();
                    let queue = state.receive_state.context();
                    let strand = Arc::clone(&self.strand);
                    dispatches.push(Box::new(move || {
                        let event = ReceiveEvent {
                            kind: EventType::Deadline,
                            context: ReceiveContext {
                                data: Vec::new(),
                                endpoint: None,
                                queue,
                                timestamp: None,
                                error: Some(Error::WouldBlockReceive),
                            },
                        };
                        callback.fire(event, Some(&strand), true);
                    }));
                }
                let _ = self.sync_interest(&mut state);
            }
        }
        run_dispatches(dispatches);
    }

    fn receive_cancelled(&self, id: u64) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            let position = state.receive_queue.iter().position(|entry| entry.id == id);
            if let Some(position) = position {
                let mut entry = state.receive_queue.remove(position).unwrap();
                if let Some(timer) = entry.timer.take() {
                    timer.cancel();
                }
                if let Some(callback) = entry.callback.take() {
                    let queue = state.receive_state.context();
                    let strand = Arc::clone(&self.strand);
                    dispatches.push(Box::new(move || {
                        let event = ReceiveEvent {
                            kind: EventType::Canceled,
                            context: ReceiveContext {
                                data: Vec::new(),
                                endpoint: None,
                                queue,
                                timestamp: None,
                                error: Some(Error::Cancelled),
                            },
                        };
                        callback.fire(event, Some(&strand), true);
                    }));
                }
                let _ = self.sync_interest(&mut state);
            }
        }
        run_dispatches(dispatches);
    }

    fn shutdown(&self, which: ShutdownType, mode: ShutdownMode) -> Result<()> {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if state.open == OpenState::Closed || state.closing {
                return Err(Error::Invalid);
            }

            if which.applies_to_send() && !state.send_shut {
                state.send_no_enqueue = true;
                match mode {
                    ShutdownMode::Graceful => {
                        if state.send_queue.is_empty() {
                            self.finish_send_shutdown(
                                &mut state,
                                &mut dispatches,
                                ShutdownOrigin::Source,
                                None,
                            );
                        }
                        // Otherwise the drain completes it.
                    }
                    ShutdownMode::Immediate => {
                        let entries: Vec<SendEntry> = state.send_queue.drain(..).collect();
                        for entry in entries {
                            self.fail_send_entry(
                                &mut state,
                                entry,
                                Error::ConnectionDead,
                                &mut dispatches,
                            );
                        }
                        self.finish_send_shutdown(
                            &mut state,
                            &mut dispatches,
                            ShutdownOrigin::Source,
                            None,
                        );
                    }
                }
            }

            if which.applies_to_receive() && !state.receive_shut {
                state.receive_shut = true;
                if let Some(socket) = state.socket.as_ref() {
                    let _ = net::shutdown(socket, Shutdown::Read);
                }
                match mode {
                    ShutdownMode::Graceful => {
                        // Buffered bytes still satisfy pending receives;
                        // the rest observe end-of-file.
                        self.satisfy_receives(&mut state, &mut dispatches);
                    }
                    ShutdownMode::Immediate => {
                        state.receive_buffer.clear();
                        let entries: Vec<ReceiveEntry> =
                            state.receive_queue.drain(..).collect();
                        for mut entry in entries {
                            if let Some(timer) = entry.timer.take() {
                                timer.cancel();
                            }
                            if let Some(callback) = entry.callback.take() {
                                callback.clear_cancel_hook();
                                let queue = state.receive_state.context();
                                let strand = Arc::clone(&self.strand);
                                dispatches.push(Box::new(move || {
                                    let event = ReceiveEvent {
                                        kind: EventType::Error,
                                        context: ReceiveContext {
                                            data: Vec::new(),
                                            endpoint: None,
                                            queue,
                                            timestamp: None,
                                            error: Some(Error::ConnectionDead),
                                        },
                                    };
                                    callback.fire(event, Some(&strand), true);
                                }));
                            }
                        }
                    }
                }
                let send = state.send_shut;
                self.observe(&state, &mut dispatches, move |session| {
                    session.on_shutdown(ShutdownEvent {
                        kind: EventType::Complete,
                        context: ShutdownContext {
                            origin: ShutdownOrigin::Source,
                            send,
                            receive: true,
                            error: None,
                        },
                    });
                });
            }

            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
        Ok(())
    }

    /// Performs the OS-level send shutdown and reports it. Holds the state
    /// lock.
    fn finish_send_shutdown(
        &self,
        state: &mut StreamState,
        dispatches: &mut Dispatches,
        origin: ShutdownOrigin,
        error: Option<Error>,
    ) {
        if state.send_shut {
            return;
        }
        state.send_shut = true;
        state.send_no_enqueue = true;
        if let Some(socket) = state.socket.as_ref() {
            let _ = net::shutdown(socket, Shutdown::Write);
        }
        let receive = state.receive_shut;
        self.observe(state, dispatches, move |session| {
            session.on_shutdown(ShutdownEvent {
                kind: EventType::Complete,
                context: ShutdownContext {
                    origin,
                    send: true,
                    receive,
                    error,
                },
            });
        });
    }

    fn apply_flow_control(
        &self,
        which: FlowControlType,
        mode: FlowControlMode,
        enable: bool,
    ) -> Result<()> {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if state.open == OpenState::Closed {
                return Err(Error::Invalid);
            }
            if which.applies_to_send() {
                if enable {
                    state.flow.enable_send = true;
                    state.pausing_send = false;
                    self.drain_send_queue(&mut state, &mut dispatches);
                } else if mode == FlowControlMode::Graceful && !state.send_queue.is_empty() {
                    state.pausing_send = true;
                } else {
                    state.flow.enable_send = false;
                    state.pausing_send = false;
                }
            }
            if which.applies_to_receive() {
                state.flow.enable_receive = enable;
            }
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
        Ok(())
    }

    fn upgrade(
        &self,
        mut session: Box<dyn EncryptionSession>,
        role: EncryptionRole,
        callback: Callback<UpgradeEvent>,
    ) -> Result<()> {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if state.open != OpenState::Connected || state.encryption.is_some() {
                return Err(Error::Invalid);
            }
            let initial = session.initiate(role)?;
            state.encryption = Some(EncryptionState {
                session,
                established: false,
                pending: VecDeque::new(),
                upgrade_callback: Some(callback),
                downgrade_callback: None,
                send_downgraded: false,
            });
            self.observe(&state, &mut dispatches, |session| {
                session.on_upgrade(UpgradeEvent {
                    kind: EventType::Initiated,
                    context: UpgradeContext::default(),
                });
            });
            self.enqueue_raw_send(&mut state, initial);
            self.drain_send_queue(&mut state, &mut dispatches);
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
        Ok(())
    }

    fn downgrade(&self, callback: Callback<DowngradeEvent>) -> Result<()> {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            let encryption = state.encryption.as_mut().ok_or(Error::Invalid)?;
            if !encryption.established || encryption.downgrade_callback.is_some() {
                return Err(Error::Invalid);
            }
            let close_notify = encryption.session.close_notify()?;
            encryption.send_downgraded = true;
            encryption.downgrade_callback = Some(callback);
            self.observe(&state, &mut dispatches, |session| {
                session.on_downgrade(DowngradeEvent {
                    kind: EventType::Initiated,
                    context: DowngradeContext {
                        send: true,
                        receive: false,
                        error: None,
                    },
                });
            });
            self.enqueue_raw_send(&mut state, close_notify);
            self.drain_send_queue(&mut state, &mut dispatches);
            self.maybe_finish_downgrade(&mut state, &mut dispatches);
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
        Ok(())
    }

    /// Completes the downgrade once the peer's close-notify was consumed.
    /// Holds the state lock.
    fn maybe_finish_downgrade(&self, state: &mut StreamState, dispatches: &mut Dispatches) {
        let done = state
            .encryption
            .as_ref()
            .map_or(false, |enc| enc.send_downgraded && enc.session.peer_closed());
        if !done {
            return;
        }
        let encryption = state.encryption.take().unwrap();
        if let Some(callback) = encryption.downgrade_callback {
            let strand = Arc::clone(&self.strand);
            dispatches.push(Box::new(move || {
                let event = DowngradeEvent {
                    kind: EventType::Complete,
                    context: DowngradeContext {
                        send: true,
                        receive: true,
                        error: None,
                    },
                };
                callback.fire(event, Some(&strand), true);
            }));
        }
    }

    /// Routes freshly read bytes through the encryption session when one is
    /// active. Holds the state lock.
    fn ingest(&self, state: &mut StreamState, chunk: &[u8], dispatches: &mut Dispatches) {
        if state.encryption.is_none() {
            state.receive_buffer.extend_from_slice(chunk);
            if let Some(crossing) = state.receive_state.add(chunk.len()) {
                let context = state.receive_state.context();
                self.observe(state, dispatches, move |session| {
                    session.on_watermark(WatermarkEvent {
                        direction: QueueDirection::Receive,
                        kind: crossing,
                        context,
                    });
                });
            }
            return;
        }

        let encryption = state.encryption.as_mut().unwrap();
        match encryption.session.push_incoming(chunk) {
            Ok(output) => {
                let established_now = !encryption.established && encryption.session.is_established();
                if established_now {
                    encryption.established = true;
                }
                let pending: Vec<_> = if established_now {
                    encryption.pending.drain(..).collect()
                } else {
                    Vec::new()
                };
                let upgrade_callback = if established_now {
                    encryption.upgrade_callback.take()
                } else {
                    None
                };

                if !output.plaintext.is_empty() {
                    state.receive_buffer.extend_from_slice(&output.plaintext);
                    if let Some(crossing) = state.receive_state.add(output.plaintext.len()) {
                        let context = state.receive_state.context();
                        self.observe(state, dispatches, move |session| {
                            session.on_watermark(WatermarkEvent {
                                direction: QueueDirection::Receive,
                                kind: crossing,
                                context,
                            });
                        });
                    }
                }
                self.enqueue_raw_send(state, output.outgoing);

                if established_now {
                    self.observe(state, dispatches, |session| {
                        session.on_upgrade(UpgradeEvent {
                            kind: EventType::Complete,
                            context: UpgradeContext::default(),
                        });
                    });
                    if let Some(callback) = upgrade_callback {
                        let strand = Arc::clone(&self.strand);
                        dispatches.push(Box::new(move || {
                            callback.fire(
                                UpgradeEvent {
                                    kind: EventType::Complete,
                                    context: UpgradeContext::default(),
                                },
                                Some(&strand),
                                true,
                            );
                        }));
                    }
                    for (data, callback, options) in pending {
                        self.enqueue_send(state, data, options, callback, dispatches);
                    }
                }

                self.maybe_finish_downgrade(state, dispatches);
            }
            Err(error) => {
                let terminal = state
                    .encryption
                    .as_mut()
                    .and_then(|enc| enc.upgrade_callback.take());
                self.observe(state, dispatches, move |session| {
                    session.on_upgrade(UpgradeEvent {
                        kind: EventType::Error,
                        context: UpgradeContext { error: Some(error) },
                    });
                });
                if let Some(callback) = terminal {
                    let strand = Arc::clone(&self.strand);
                    dispatches.push(Box::new(move || {
                        callback.fire(
                            UpgradeEvent {
                                kind: EventType::Error,
                                context: UpgradeContext { error: Some(error) },
                            },
                            Some(&strand),
                            true,
                        );
                    }));
                }
            }
        }
    }

    fn ensure_attached(&self, state: &mut StreamState) -> Result<Token> {
        if let Some(token) = state.token {
            return Ok(token);
        }
        let arc: Arc<dyn DriverSocket> = self.arc();
        let token = self.driver.attach(arc)?;
        state.token = Some(token);
        Ok(token)
    }

    /// Reconciles engine interest with the queues, flow control, and open
    /// state. Holds the state lock.
    fn sync_interest(&self, state: &mut StreamState) -> Result<()> {
        if state.detach != DetachState::Idle || state.socket.is_none() {
            return Ok(());
        }

        let connecting = state.connect.as_ref().map_or(false, |c| c.current.is_some());
        let want_read = state.open == OpenState::Connected
            && state.flow.enable_receive
            && !state.receive_shut
            && !state.receive_eof
            && !state.receive_state.is_over_high();
        let want_write = (state.open == OpenState::Connected
            && (state.flow.enable_send || state.pausing_send)
            && !state.send_queue.is_empty())
            || connecting;
        let want_notify = !state.zero_copy_pending.is_empty();

        if !(want_read || want_write || want_notify)
            && !state.shown_readable
            && !state.shown_writable
            && !state.shown_notifications
        {
            return Ok(());
        }

        let token = self.ensure_attached(state)?;

        if want_read && !state.shown_readable {
            self.driver.show(token, Interest::READABLE)?;
            state.shown_readable = true;
        } else if !want_read && state.shown_readable {
            self.driver.hide(token, Interest::READABLE)?;
            state.shown_readable = false;
        }

        if want_write && !state.shown_writable {
            self.driver.show(token, Interest::WRITABLE)?;
            state.shown_writable = true;
        } else if !want_write && state.shown_writable {
            self.driver.hide(token, Interest::WRITABLE)?;
            state.shown_writable = false;
        }

        if want_notify && !state.shown_notifications {
            self.driver.show(token, Interest::NOTIFICATIONS)?;
            state.shown_notifications = true;
        } else if !want_notify && state.shown_notifications {
            self.driver.hide(token, Interest::NOTIFICATIONS)?;
            state.shown_notifications = false;
        }

        Ok(())
    }

    fn close(&self, callback: Option<Callback<()>>) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if let Some(callback) = callback {
                if state.open == OpenState::Closed {
                    // Close is idempotent; late callbacks still fire.
                    let strand = Arc::clone(&self.strand);
                    dispatches.push(Box::new(move || {
                        callback.fire((), Some(&strand), true);
                    }));
                    run_dispatches(dispatches);
                    return;
                }
                state.close_callbacks.push(callback);
            } else if state.open == OpenState::Closed {
                return;
            }
            if state.closing {
                // A close is already in flight; the callback queued above
                // rides along.
                run_dispatches(dispatches);
                return;
            }
            state.closing = true;
            debug!("stream {} closing", self.id);

            // Cancel everything pending with `Cancelled`.
            if state.connect.is_some() {
                let pending = state.connect.take().unwrap();
                if let Some(timer) = &pending.timer {
                    timer.cancel();
                }
                if let Some(cb) = pending.callback {
                    let event = connect_event(
                        EventType::Canceled,
                        pending.current,
                        pending.name,
                        pending.attempts,
                        Some(Error::Cancelled),
                    );
                    let strand = Arc::clone(&self.strand);
                    dispatches.push(Box::new(move || {
                        cb.fire(event, Some(&strand), true);
                    }));
                }
            }
            let sends: Vec<SendEntry> = state.send_queue.drain(..).collect();
            for entry in sends {
                self.cancel_send_entry(&mut state, entry, &mut dispatches);
            }
            let receives: Vec<ReceiveEntry> = state.receive_queue.drain(..).collect();
            for mut entry in receives {
                if let Some(timer) = entry.timer.take() {
                    timer.cancel();
                }
                if let Some(callback) = entry.callback.take() {
                    let queue = state.receive_state.context();
                    let strand = Arc::clone(&self.strand);
                    dispatches.push(Box::new(move || {
                        let event = ReceiveEvent {
                            kind: EventType::Canceled,
                            context: ReceiveContext {
                                data: Vec::new(),
                                endpoint: None,
                                queue,
                                timestamp: None,
                                error: Some(Error::Cancelled),
                            },
                        };
                        callback.fire(event, Some(&strand), true);
                    }));
                }
            }
            let zero_copy: Vec<ZeroCopyPending> = state.zero_copy_pending.drain(..).collect();
            for pending in zero_copy {
                if let Some(callback) = pending.callback {
                    let strand = Arc::clone(&self.strand);
                    let queue = state.send_state.context();
                    dispatches.push(Box::new(move || {
                        let event = SendEvent {
                            kind: EventType::Canceled,
                            context: SendContext {
                                bytes_sent: 0,
                                queue,
                                zero_copy_acknowledged: false,
                                timestamp: None,
                                error: Some(Error::Cancelled),
                            },
                        };
                        callback.fire(event, Some(&strand), true);
                    }));
                }
            }

            state.detach_purpose = DetachPurpose::Close;
            match state.token {
                Some(token) => {
                    state.detach = DetachState::Initiated;
                    // Deferred past the unlock: an idle engine completes
                    // the detach on the calling thread.
                    let driver = Arc::clone(&self.driver);
                    dispatches.push(Box::new(move || {
                        let _ = driver.detach(token);
                    }));
                }
                None => {
                    // Never attached; release directly.
                    self.release(&mut state);
                }
            }
        }
        run_dispatches(dispatches);
    }

    /// Final teardown: closes the handle exactly once, releases the
    /// reservation, and fires close callbacks. Holds the state lock.
    fn release(&self, state: &mut StreamState) {
        self.fd.store(-1, Ordering::SeqCst);
        state.socket = None;
        state.token = None;
        state.open = OpenState::Closed;
        state.detach = DetachState::Idle;
        if state.reserved {
            state.reserved = false;
            if let Some(reservation) = self.reservation.lock().as_ref() {
                reservation.release();
            }
        }
        let callbacks = std::mem::take(&mut state.close_callbacks);
        let strand = Arc::clone(&self.strand);
        for callback in callbacks {
            let strand = Arc::clone(&strand);
            // Already under the lock; post rather than invoke.
            strand.execute(Box::new(move || {
                callback.fire((), None, false);
            }));
        }
        debug!("stream {} closed", self.id);
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.reserved {
            state.reserved = false;
            if let Some(reservation) = self.reservation.get_mut().as_ref() {
                reservation.release();
            }
        }
    }
}

impl DriverSocket for StreamInner {
    fn handle(&self) -> Handle {
        self.fd.load(Ordering::SeqCst)
    }

    fn process_readable(&self) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if state.open != OpenState::Connected || state.receive_shut {
                return;
            }
            loop {
                if state.receive_state.is_over_high() || !state.flow.enable_receive {
                    break;
                }
                let fd = match state.socket.as_ref() {
                    Some(socket) => socket.as_raw_fd_i32(),
                    None => break,
                };
                let mut chunk = [0u8; 8192];
                let mut bufs = [IoSliceMut::new(&mut chunk)];
                match net::recv_vectored(fd, &mut bufs) {
                    Ok(0) => {
                        state.receive_eof = true;
                        if !state.remote_shutdown_reported {
                            state.remote_shutdown_reported = true;
                            let send = state.send_shut;
                            self.observe(&state, &mut dispatches, move |session| {
                                session.on_shutdown(ShutdownEvent {
                                    kind: EventType::Complete,
                                    context: ShutdownContext {
                                        origin: ShutdownOrigin::Remote,
                                        send,
                                        receive: true,
                                        error: None,
                                    },
                                });
                            });
                        }
                        break;
                    }
                    Ok(n) => {
                        let received = &chunk[..n];
                        self.ingest(&mut state, received, &mut dispatches);
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        let error = Error::from(err);
                        self.observe(&state, &mut dispatches, move |session| {
                            session.on_error(ErrorEvent { error });
                        });
                        state.receive_eof = true;
                        break;
                    }
                }
            }
            self.satisfy_receives(&mut state, &mut dispatches);
            // The handshake may have produced records to flush.
            self.drain_send_queue(&mut state, &mut dispatches);
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
    }

    fn process_writable(&self) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if state.connect.as_ref().map_or(false, |c| c.current.is_some()) {
                // The in-flight connect resolved; zero pending error means
                // established.
                let outcome = state
                    .socket
                    .as_ref()
                    .map(net::take_error)
                    .unwrap_or_else(|| Ok(None));
                match outcome {
                    Ok(None) => self.finish_connect_success(&mut state, &mut dispatches),
                    Ok(Some(err)) => {
                        let error = Error::from(err);
                        if let Some(pending) = state.connect.as_mut() {
                            pending.last_error = Some(error);
                            pending.current = None;
                        }
                        if state
                            .connect
                            .as_ref()
                            .map_or(false, |p| p.remaining.is_empty())
                        {
                            self.finish_connect_error(&mut state, &mut dispatches, error);
                        } else {
                            self.recycle_handle(&mut state, &mut dispatches);
                        }
                    }
                    Err(err) => {
                        let error = Error::from(err);
                        self.finish_connect_error(&mut state, &mut dispatches, error);
                    }
                }
            } else {
                self.drain_send_queue(&mut state, &mut dispatches);
            }
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
    }

    fn process_error(&self) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            let pending_error = state
                .socket
                .as_ref()
                .and_then(|socket| net::take_error(socket).ok().flatten());
            if let Some(err) = pending_error {
                let error = Error::from(err);
                if state.connect.as_ref().map_or(false, |c| c.current.is_some()) {
                    if let Some(pending) = state.connect.as_mut() {
                        pending.last_error = Some(error);
                        pending.current = None;
                    }
                    if state
                        .connect
                        .as_ref()
                        .map_or(false, |p| p.remaining.is_empty())
                    {
                        self.finish_connect_error(&mut state, &mut dispatches, error);
                    } else {
                        self.recycle_handle(&mut state, &mut dispatches);
                    }
                } else {
                    self.observe(&state, &mut dispatches, move |session| {
                        session.on_error(ErrorEvent { error });
                    });
                }
            }
        }
        run_dispatches(dispatches);
    }

    fn process_notifications(&self) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            let fd = match state.socket.as_ref() {
                Some(socket) => socket.as_raw_fd_i32(),
                None => return,
            };
            match net::drain_notifications(fd) {
                Ok(ranges) if !ranges.is_empty() => {
                    state.zero_copy_acks.extend(ranges);
                    self.settle_zero_copy(&mut state, &mut dispatches);
                    let _ = self.sync_interest(&mut state);
                }
                _ => {}
            }
        }
        run_dispatches(dispatches);
    }

    fn process_detached(&self) {
        let mut dispatches = Dispatches::new();
        let purpose = {
            let mut state = self.state.lock();
            state.detach = DetachState::Scheduled;
            state.detach_purpose
        };
        match purpose {
            DetachPurpose::Close => {
                let weak = Weak::clone(&self.weak);
                // The completion runs on the socket's strand.
                self.strand.execute(Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        let mut state = inner.state.lock();
                        inner.release(&mut state);
                    }
                }));
            }
            DetachPurpose::Reconnect => {
                let mut state = self.state.lock();
                state.detach = DetachState::Idle;
                state.token = None;
                if let Some(pending) = state.connect.as_mut() {
                    pending.awaiting_detach = false;
                }
                self.attempt_connect(&mut state, &mut dispatches);
            }
        }
        run_dispatches(dispatches);
    }
}

/// Applies best-effort socket options; failures are logged, not fatal.
pub(crate) fn apply_options(socket: &socket2::Socket, options: &SocketOptions) {
    if options.reuse_address {
        if let Err(err) = socket.set_reuse_address(true) {
            warn!("unable to set SO_REUSEADDR: {}", err);
        }
    }
    if options.keep_alive {
        if let Err(err) = socket.set_keepalive(true) {
            warn!("unable to set SO_KEEPALIVE: {}", err);
        }
    }
    if options.no_delay {
        if let Err(err) = socket.set_nodelay(true) {
            warn!("unable to set TCP_NODELAY: {}", err);
        }
    }
    if options.linger.is_some() {
        if let Err(err) = socket.set_linger(options.linger) {
            warn!("unable to set SO_LINGER: {}", err);
        }
    }
    if let Some(size) = options.send_buffer_size {
        if let Err(err) = socket.set_send_buffer_size(size) {
            warn!("unable to set SO_SNDBUF: {}", err);
        }
    }
    if let Some(size) = options.receive_buffer_size {
        if let Err(err) = socket.set_recv_buffer_size(size) {
            warn!("unable to set SO_RCVBUF: {}", err);
        }
    }
}

/// `socket2::Socket::as_raw_fd` through a helper so call sites read the
/// same on every platform alias of `RawFd`.
trait AsRawFdI32 {
    fn as_raw_fd_i32(&self) -> i32;
}

impl AsRawFdI32 for socket2::Socket {
    fn as_raw_fd_i32(&self) -> i32 {
        use std::os::fd::AsRawFd;
        self.as_raw_fd()
    }
}
