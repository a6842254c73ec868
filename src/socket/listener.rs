//! The listener socket state machine.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::callback::Callback;
use crate::driver::{Driver, DriverSocket, Handle};
use crate::endpoint::{Endpoint, Transport};
use crate::queue::{QueueDirection, QueueState};
use crate::reservation::Reservation;
use crate::socket::event::{
    AcceptContext, AcceptEvent, ErrorEvent, EventType, WatermarkEvent,
};
use crate::socket::options::{AcceptOptions, SocketOptions};
use crate::socket::stream::{apply_options, StreamSocket};
use crate::socket::{next_socket_id, DetachState, OpenState, SocketSession};
use crate::strand::Strand;
use crate::sys::net;
use crate::timer::{Timer, TimerEventType, TimerOptions};
use crate::{Error, Interest, Result, Token};

type Dispatches = Vec<Box<dyn FnOnce() + Send>>;

fn run_dispatches(dispatches: Dispatches) {
    for dispatch in dispatches {
        dispatch();
    }
}

struct AcceptEntry {
    id: u64,
    callback: Option<Callback<AcceptEvent>>,
    timer: Option<Timer>,
    recurse: bool,
}

struct Ready {
    socket: socket2::Socket,
    peer: Endpoint,
    reserved: bool,
}

struct ListenerState {
    socket: Option<socket2::Socket>,
    transport: Option<Transport>,
    token: Option<Token>,
    open: OpenState,
    detach: DetachState,
    options: SocketOptions,
    session: Option<Arc<dyn SocketSession>>,
    // Connections accepted from the OS but not yet claimed.
    ready: VecDeque<Ready>,
    pending: VecDeque<AcceptEntry>,
    accept_state: QueueState,
    shown_readable: bool,
    close_callbacks: Vec<Callback<()>>,
    closing: bool,
    next_op_id: u64,
}

pub(crate) struct ListenerInner {
    id: u64,
    driver: Arc<dyn Driver>,
    strand: Arc<Strand>,
    reservation: Mutex<Option<Arc<Reservation>>>,
    fd: AtomicI32,
    state: Mutex<ListenerState>,
    weak: Weak<ListenerInner>,
}

/// An asynchronous listening socket producing connected [`StreamSocket`]s.
#[derive(Clone)]
pub struct ListenerSocket {
    inner: Arc<ListenerInner>,
}

impl ListenerSocket {
    pub fn new(driver: Arc<dyn Driver>) -> ListenerSocket {
        ListenerSocket::with_options(driver, SocketOptions::default())
    }

    pub fn with_options(driver: Arc<dyn Driver>, options: SocketOptions) -> ListenerSocket {
        let strand = driver.new_strand();
        // The accept queue's watermarks bound ready connections by count.
        let inner = Arc::new_cyclic(|weak| ListenerInner {
            id: next_socket_id(),
            driver,
            strand,
            reservation: Mutex::new(None),
            fd: AtomicI32::new(-1),
            state: Mutex::new(ListenerState {
                socket: None,
                transport: None,
                token: None,
                open: OpenState::Default,
                detach: DetachState::Idle,
                options,
                session: None,
                ready: VecDeque::new(),
                pending: VecDeque::new(),
                accept_state: QueueState::new(0, 1_024),
                shown_readable: false,
                close_callbacks: Vec::new(),
                closing: false,
                next_op_id: 1,
            }),
            weak: weak.clone(),
        });
        ListenerSocket { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn strand(&self) -> Arc<Strand> {
        Arc::clone(&self.inner.strand)
    }

    pub fn set_session(&self, session: Arc<dyn SocketSession>) {
        self.inner.state.lock().session = Some(session);
    }

    /// Attaches a handle-count reservation charged per accepted connection.
    pub fn set_reservation(&self, reservation: Arc<Reservation>) {
        *self.inner.reservation.lock() = Some(reservation);
    }

    pub fn open(&self, transport: Transport) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.open != OpenState::Default {
            return Err(Error::Invalid);
        }
        if !transport.is_stream() {
            return Err(Error::Invalid);
        }
        let socket = net::open(transport).map_err(Error::from)?;
        apply_options(&socket, &state.options);
        self.inner.fd.store(raw_fd(&socket), Ordering::SeqCst);
        state.socket = Some(socket);
        state.transport = Some(transport);
        state.open = OpenState::Waiting;
        debug!("listener {} opened over {}", self.inner.id, transport);
        Ok(())
    }

    pub fn bind(&self, endpoint: &Endpoint) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.open == OpenState::Default {
            drop(state);
            self.open(endpoint.stream_transport())?;
            state = self.inner.state.lock();
        }
        if state.open != OpenState::Waiting {
            return Err(Error::Invalid);
        }
        let socket = state.socket.as_ref().ok_or(Error::Invalid)?;
        net::bind(socket, endpoint).map_err(Error::from)
    }

    pub fn local_endpoint(&self) -> Result<Endpoint> {
        let state = self.inner.state.lock();
        let socket = state.socket.as_ref().ok_or(Error::Invalid)?;
        net::local_endpoint(socket).map_err(Error::from)
    }

    /// Starts listening; the handle must be bound.
    pub fn listen(&self, backlog: usize) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.open != OpenState::Waiting {
            return Err(Error::Invalid);
        }
        let socket = state.socket.as_ref().ok_or(Error::Invalid)?;
        net::listen(socket, backlog.min(i32::MAX as usize) as i32).map_err(Error::from)?;
        state.open = OpenState::Connected;
        self.inner.sync_interest(&mut state)?;
        debug!("listener {} listening (backlog {})", self.inner.id, backlog);
        Ok(())
    }

    /// Queues an accept; the callback observes the accepted stream.
    pub fn accept(&self, options: AcceptOptions, callback: Callback<AcceptEvent>) -> Result<()> {
        self.inner.accept(options, callback)
    }

    /// Begins detach, cancels pending accepts with `Cancelled`, releases
    /// the handle, then invokes `callback`. Idempotent.
    pub fn close(&self, callback: Option<Callback<()>>) {
        self.inner.close(callback)
    }
}

impl std::fmt::Debug for ListenerSocket {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        fmt.debug_struct("ListenerSocket")
            .field("id", &self.inner.id)
            .field("open", &state.open)
            .field("ready", &state.ready.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl ListenerInner {
    fn observe(
        &self,
        state: &ListenerState,
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

    fn accept(&self, options: AcceptOptions, callback: Callback<AcceptEvent>) -> Result<()> {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if state.closing || state.open != OpenState::Connected {
                return Err(Error::Invalid);
            }

            let id = state.next_op_id;
            state.next_op_id += 1;
            let mut entry = AcceptEntry {
                id,
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
                        inner.accept_deadline(id);
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
                        inner.accept_cancelled(id);
                    }
                });
            }

            state.pending.push_back(entry);
            self.satisfy_accepts(&mut state, &mut dispatches);
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
        Ok(())
    }

    /// Pairs ready connections with pending accepts. Holds the state lock.
    fn satisfy_accepts(&self, state: &mut ListenerState, dispatches: &mut Dispatches) {
        while !state.ready.is_empty() && !state.pending.is_empty() {
            let mut entry = state.pending.pop_front().unwrap();
            let ready = state.ready.pop_front().unwrap();
            if let Some(timer) = entry.timer.take() {
                timer.cancel();
            }
            let callback = match entry.callback.take() {
                Some(callback) => callback,
                None => {
                    state.ready.push_front(ready);
                    continue;
                }
            };
            callback.clear_cancel_hook();

            if let Some(crossing) = state.accept_state.remove(1) {
                let context = state.accept_state.context();
                self.observe(state, dispatches, move |session| {
                    session.on_watermark(WatermarkEvent {
                        direction: QueueDirection::Accept,
                        kind: crossing,
                        context,
                    });
                });
            }

            let reservation = if ready.reserved {
                self.reservation.lock().clone()
            } else {
                None
            };
            let stream = StreamSocket::from_accepted(
                Arc::clone(&self.driver),
                ready.socket,
                state.transport.unwrap_or(Transport::TcpIpv4),
                reservation,
                state.options.clone(),
            );
            let queue = state.accept_state.context();
            let strand = Arc::clone(&self.strand);
            let defer = !entry.recurse;
            let peer = ready.peer;
            dispatches.push(Box::new(move || match stream {
                Ok(stream) => {
                    let event = AcceptEvent {
                        kind: EventType::Complete,
                        context: AcceptContext {
                            endpoint: Some(peer),
                            queue,
                            error: None,
                        },
                        socket: Some(stream),
                    };
                    let cancelled = AcceptEvent {
                        kind: EventType::Canceled,
                        context: AcceptContext {
                            endpoint: None,
                            queue,
                            error: Some(Error::Cancelled),
                        },
                        socket: None,
                    };
                    callback.complete_or(event, cancelled, Some(&strand), defer);
                }
                Err(error) => {
                    let event = AcceptEvent {
                        kind: EventType::Error,
                        context: AcceptContext {
                            endpoint: Some(peer),
                            queue,
                            error: Some(error),
                        },
                        socket: None,
                    };
                    callback.fire(event, Some(&strand), true);
                }
            }));
        }
    }

    fn accept_deadline(&self, id: u64) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            let position = state.pending.iter().position(|entry| entry.id == id);
            if let Some(position) = position {
                let mut entry = state.pending.remove(position).unwrap();
                entry.timer = None;
                if let Some(callback) = entry.callback.take() {
                    callback.clear_cancel_hook();
                    let queue = state.accept_state.context();
                    let strand = Arc::clone(&self.strand);
                    dispatches.push(Box::new(move || {
                        let event = AcceptEvent {
                            kind: EventType::Deadline,
                            context: AcceptContext {
                                endpoint: None,
                                queue,
                                error: Some(Error::WouldBlock),
                            },
                            socket: None,
                        };
                        callback.fire(event, Some(&strand), true);
                    }));
                }
            }
        }
        run_dispatches(dispatches);
    }

    fn accept_cancelled(&self, id: u64) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            let position = state.pending.iter().position(|entry| entry.id == id);
            if let Some(position) = position {
                let mut entry = state.pending.remove(position).unwrap();
                if let Some(timer) = entry.timer.take() {
                    timer.cancel();
                }
                if let Some(callback) = entry.callback.take() {
                    let queue = state.accept_state.context();
                    let strand = Arc::clone(&self.strand);
                    dispatches.push(Box::new(move || {
                        let event = AcceptEvent {
                            kind: EventType::Canceled,
                            context: AcceptContext {
                                endpoint: None,
                                queue,
                                error: Some(Error::Cancelled),
                            },
                            socket: None,
                        };
                        callback.fire(event, Some(&strand), true);
                    }));
                }
            }
        }
        run_dispatches(dispatches);
    }

    fn ensure_attached(&self, state: &mut ListenerState) -> Result<Token> {
        if let Some(token) = state.token {
            return Ok(token);
        }
        let arc: Arc<dyn DriverSocket> = self
            .weak
            .upgrade()
            .expect("listener inner already released");
        let token = self.driver.attach(arc)?;
        state.token = Some(token);
        Ok(token)
    }

    fn sync_interest(&self, state: &mut ListenerState) -> Result<()> {
        if state.detach != DetachState::Idle || state.socket.is_none() {
            return Ok(());
        }
        let want_read =
            state.open == OpenState::Connected && !state.accept_state.is_over_high();
        if !want_read && !state.shown_readable {
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
        Ok(())
    }

    fn close(&self, callback: Option<Callback<()>>) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if let Some(callback) = callback {
                if state.open == OpenState::Closed {
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
                run_dispatches(dispatches);
                return;
            }
            state.closing = true;
            debug!("listener {} closing", self.id);

            let entries: Vec<AcceptEntry> = state.pending.drain(..).collect();
            for mut entry in entries {
                if let Some(timer) = entry.timer.take() {
                    timer.cancel();
                }
                if let Some(callback) = entry.callback.take() {
                    let queue = state.accept_state.context();
                    let strand = Arc::clone(&self.strand);
                    dispatches.push(Box::new(move || {
                        let event = AcceptEvent {
                            kind: EventType::Canceled,
                            context: AcceptContext {
                                endpoint: None,
                                queue,
                                error: Some(Error::Cancelled),
                            },
                            socket: None,
                        };
                        callback.fire(event, Some(&strand), true);
                    }));
                }
            }
            // Unclaimed connections are closed and their reservations
            // returned.
            let ready: Vec<Ready> = state.ready.drain(..).collect();
            let reservation = self.reservation.lock().clone();
            for entry in ready {
                if entry.reserved {
                    if let Some(reservation) = &reservation {
                        reservation.release();
                    }
                }
            }

            match state.token {
                Some(token) => {
                    state.detach = DetachState::Initiated;
                    let driver = Arc::clone(&self.driver);
                    dispatches.push(Box::new(move || {
                        let _ = driver.detach(token);
                    }));
                }
                None => self.release(&mut state),
            }
        }
        run_dispatches(dispatches);
    }

    fn release(&self, state: &mut ListenerState) {
        self.fd.store(-1, Ordering::SeqCst);
        state.socket = None;
        state.token = None;
        state.open = OpenState::Closed;
        state.detach = DetachState::Idle;
        let callbacks = std::mem::take(&mut state.close_callbacks);
        for callback in callbacks {
            let strand = Arc::clone(&self.strand);
            strand.execute(Box::new(move || {
                callback.fire((), None, false);
            }));
        }
        debug!("listener {} closed", self.id);
    }
}

impl DriverSocket for ListenerInner {
    fn handle(&self) -> Handle {
        self.fd.load(Ordering::SeqCst)
    }

    fn process_readable(&self) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if state.open != OpenState::Connected {
                return;
            }
            loop {
                if state.accept_state.is_over_high() {
                    break;
                }
                let outcome = match state.socket.as_ref() {
                    Some(socket) => net::accept(socket),
                    None => break,
                };
                match outcome {
                    Ok((accepted, peer)) => {
                        // Charge the handle table before admitting the
                        // connection.
                        let reservation = self.reservation.lock().clone();
                        let reserved = match &reservation {
                            Some(reservation) => {
                                if reservation.acquire() {
                                    true
                                } else {
                                    drop(accepted);
                                    warn!(
                                        "listener {} refusing connection from {}: handle limit",
                                        self.id, peer
                                    );
                                    self.fail_next_accept(&mut state, &mut dispatches, Error::Limit);
                                    self.observe(&state, &mut dispatches, |session| {
                                        session.on_error(ErrorEvent {
                                            error: Error::Limit,
                                        });
                                    });
                                    continue;
                                }
                            }
                            None => false,
                        };
                        trace!("listener {} accepted {}", self.id, peer);
                        state.ready.push_back(Ready {
                            socket: accepted,
                            peer,
                            reserved,
                        });
                        if let Some(crossing) = state.accept_state.add(1) {
                            let context = state.accept_state.context();
                            self.observe(&state, &mut dispatches, move |session| {
                                session.on_watermark(WatermarkEvent {
                                    direction: QueueDirection::Accept,
                                    kind: crossing,
                                    context,
                                });
                            });
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        let error = Error::from(err);
                        self.observe(&state, &mut dispatches, move |session| {
                            session.on_error(ErrorEvent { error });
                        });
                        break;
                    }
                }
            }
            self.satisfy_accepts(&mut state, &mut dispatches);
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
    }

    fn process_writable(&self) {}

    fn process_error(&self) {
        let mut dispatches = Dispatches::new();
        {
            let state = self.state.lock();
            let pending_error = state
                .socket
                .as_ref()
                .and_then(|socket| net::take_error(socket).ok().flatten());
            if let Some(err) = pending_error {
                let error = Error::from(err);
                self.observe(&state, &mut dispatches, move |session| {
                    session.on_error(ErrorEvent { error });
                });
            }
        }
        run_dispatches(dispatches);
    }

    fn process_detached(&self) {
        {
            let mut state = self.state.lock();
            state.detach = DetachState::Scheduled;
        }
        let weak = Weak::clone(&self.weak);
        self.strand.execute(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock();
                inner.release(&mut state);
            }
        }));
    }
}

impl ListenerInner {
    /// Completes the oldest pending accept with `error` when a connection
    /// had to be refused.
    fn fail_next_accept(
        &self,
        state: &mut ListenerState,
        dispatches: &mut Dispatches,
        error: Error,
    ) {
        if let Some(mut entry) = state.pending.pop_front() {
            if let Some(timer) = entry.timer.take() {
                timer.cancel();
            }
            if let Some(callback) = entry.callback.take() {
                callback.clear_cancel_hook();
                let queue = state.accept_state.context();
                let strand = Arc::clone(&self.strand);
                dispatches.push(Box::new(move || {
                    let event = AcceptEvent {
                        kind: EventType::Error,
                        context: AcceptContext {
                            endpoint: None,
                            queue,
                            error: Some(error),
                        },
                        socket: None,
                    };
                    callback.fire(event, Some(&strand), true);
                }));
            }
        }
    }
}

fn raw_fd(socket: &socket2::Socket) -> i32 {
    use std::os::fd::AsRawFd;
    socket.as_raw_fd()
}
