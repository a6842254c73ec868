//! The datagram socket state machine.
//!
//! Datagrams have no accept surface and no byte-stream reassembly: every
//! receive completes at a datagram boundary carrying the source endpoint,
//! and every send transmits one whole datagram.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::callback::Callback;
use crate::driver::{Driver, DriverSocket, Handle};
use crate::endpoint::{Endpoint, Transport};
use crate::queue::{
    FlowControlMode, FlowControlState, FlowControlType, QueueDirection, QueueState,
};
use crate::reservation::Reservation;
use crate::socket::event::{
    ErrorEvent, EventType, ReceiveContext, ReceiveEvent, SendContext, SendEvent, WatermarkEvent,
};
use crate::socket::options::{ReceiveOptions, SendOptions, SocketOptions};
use crate::socket::stream::apply_options;
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

struct SendEntry {
    id: u64,
    data: Vec<u8>,
    endpoint: Option<Endpoint>,
    callback: Option<Callback<SendEvent>>,
    timer: Option<Timer>,
    timestamping: bool,
    recurse: bool,
}

struct ReceiveEntry {
    id: u64,
    max_size: usize,
    callback: Option<Callback<ReceiveEvent>>,
    timer: Option<Timer>,
    recurse: bool,
}

struct DatagramState {
    socket: Option<socket2::Socket>,
    transport: Option<Transport>,
    token: Option<Token>,
    open: OpenState,
    detach: DetachState,
    options: SocketOptions,
    session: Option<Arc<dyn SocketSession>>,
    flow: FlowControlState,
    peer: Option<Endpoint>,
    send_queue: VecDeque<SendEntry>,
    send_state: QueueState,
    receive_queue: VecDeque<ReceiveEntry>,
    receive_state: QueueState,
    shown_readable: bool,
    shown_writable: bool,
    close_callbacks: Vec<Callback<()>>,
    closing: bool,
    // The handle reservation was charged and must be released exactly once.
    reserved: bool,
    next_op_id: u64,
}

pub(crate) struct DatagramInner {
    id: u64,
    driver: Arc<dyn Driver>,
    strand: Arc<Strand>,
    reservation: Mutex<Option<Arc<Reservation>>>,
    fd: AtomicI32,
    state: Mutex<DatagramState>,
    weak: Weak<DatagramInner>,
}

/// An asynchronous datagram socket.
#[derive(Clone)]
pub struct DatagramSocket {
    inner: Arc<DatagramInner>,
}

impl DatagramSocket {
    pub fn new(driver: Arc<dyn Driver>) -> DatagramSocket {
        DatagramSocket::with_options(driver, SocketOptions::default())
    }

    pub fn with_options(driver: Arc<dyn Driver>, options: SocketOptions) -> DatagramSocket {
        let strand = driver.new_strand();
        let (send_low, send_high) = options
            .send_watermarks
            .unwrap_or(crate::socket::DEFAULT_WATERMARKS);
        let (recv_low, recv_high) = options
            .receive_watermarks
            .unwrap_or(crate::socket::DEFAULT_WATERMARKS);
        let inner = Arc::new_cyclic(|weak| DatagramInner {
            id: next_socket_id(),
            driver,
            strand,
            reservation: Mutex::new(None),
            fd: AtomicI32::new(-1),
            state: Mutex::new(DatagramState {
                socket: None,
                transport: None,
                token: None,
                open: OpenState::Default,
                detach: DetachState::Idle,
                options,
                session: None,
                flow: FlowControlState::new(),
                peer: None,
                send_queue: VecDeque::new(),
                send_state: QueueState::new(send_low, send_high),
                receive_queue: VecDeque::new(),
                receive_state: QueueState::new(recv_low, recv_high),
                shown_readable: false,
                shown_writable: false,
                close_callbacks: Vec::new(),
                closing: false,
                reserved: false,
                next_op_id: 1,
            }),
            weak: weak.clone(),
        });
        DatagramSocket { inner }
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

    pub fn set_reservation(&self, reservation: Arc<Reservation>) {
        *self.inner.reservation.lock() = Some(reservation);
    }

    pub fn open(&self, transport: Transport) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.open != OpenState::Default {
            return Err(Error::Invalid);
        }
        if !transport.is_datagram() {
            return Err(Error::Invalid);
        }
        let reservation = self.inner.reservation.lock().clone();
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
        self.inner.fd.store(raw_fd(&socket), Ordering::SeqCst);
        state.reserved = reservation.is_some();
        state.socket = Some(socket);
        state.transport = Some(transport);
        state.open = OpenState::Waiting;
        debug!("datagram {} opened over {}", self.inner.id, transport);
        Ok(())
    }

    pub fn bind(&self, endpoint: &Endpoint) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.open == OpenState::Default {
            drop(state);
            self.open(endpoint.datagram_transport())?;
            state = self.inner.state.lock();
        }
        if state.open != OpenState::Waiting {
            return Err(Error::Invalid);
        }
        let socket = state.socket.as_ref().ok_or(Error::Invalid)?;
        net::bind(socket, endpoint).map_err(Error::from)
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

    /// Fixes the default remote endpoint; completes synchronously for
    /// datagram transports.
    pub fn connect(&self, endpoint: Endpoint) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.open == OpenState::Default {
            drop(state);
            self.open(endpoint.datagram_transport())?;
            state = self.inner.state.lock();
        }
        if !matches!(state.open, OpenState::Waiting | OpenState::Connected) {
            return Err(Error::Invalid);
        }
        let socket = state.socket.as_ref().ok_or(Error::Invalid)?;
        net::connect(socket, &endpoint).map_err(Error::from)?;
        state.peer = Some(endpoint);
        state.open = OpenState::Connected;
        Ok(())
    }

    /// Sends one datagram to `endpoint`, or to the connected peer when
    /// `endpoint` is `None`.
    pub fn send(
        &self,
        data: Vec<u8>,
        endpoint: Option<Endpoint>,
        options: SendOptions,
        callback: Option<Callback<SendEvent>>,
    ) -> Result<()> {
        self.inner.send(data, endpoint, options, callback)
    }

    /// Posts a receive completed by the next datagram, carrying its source
    /// endpoint and a software timestamp.
    pub fn receive(&self, options: ReceiveOptions, callback: Callback<ReceiveEvent>) -> Result<()> {
        self.inner.receive(options, callback)
    }

    pub fn apply_flow_control(
        &self,
        which: FlowControlType,
        _mode: FlowControlMode,
        enable: bool,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.open == OpenState::Closed {
            return Err(Error::Invalid);
        }
        if which.applies_to_send() {
            state.flow.enable_send = enable;
        }
        if which.applies_to_receive() {
            state.flow.enable_receive = enable;
        }
        let _ = self.inner.sync_interest(&mut state);
        Ok(())
    }

    pub fn close(&self, callback: Option<Callback<()>>) {
        self.inner.close(callback)
    }
}

impl std::fmt::Debug for DatagramSocket {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        fmt.debug_struct("DatagramSocket")
            .field("id", &self.inner.id)
            .field("open", &state.open)
            .field("send_queue", &state.send_state.size())
            .finish()
    }
}

impl DatagramInner {
    fn observe(
        &self,
        state: &DatagramState,
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

    fn send(
        &self,
        data: Vec<u8>,
        endpoint: Option<Endpoint>,
        options: SendOptions,
        callback: Option<Callback<SendEvent>>,
    ) -> Result<()> {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if state.closing || state.open == OpenState::Closed {
                return Err(Error::Invalid);
            }
            if state.open == OpenState::Default {
                return Err(Error::Invalid);
            }
            if endpoint.is_none() && state.peer.is_none() {
                return Err(Error::Invalid);
            }
            if state.send_state.is_over_high() && !options.force {
                return Err(Error::WouldBlock);
            }

            let id = state.next_op_id;
            state.next_op_id += 1;
            let mut entry = SendEntry {
                id,
                data,
                endpoint,
                callback,
                timer: None,
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

            if let Some(crossing) = state.send_state.add(entry.data.len()) {
                let context = state.send_state.context();
                self.observe(&state, &mut dispatches, move |session| {
                    session.on_watermark(WatermarkEvent {
                        direction: QueueDirection::Send,
                        kind: crossing,
                        context,
                    });
                });
            }
            state.send_queue.push_back(entry);
            self.drain_send_queue(&mut state, &mut dispatches);
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
        Ok(())
    }

    /// Transmits whole datagrams from the queue head until `WouldBlock` or
    /// empty. Holds the state lock.
    fn drain_send_queue(&self, state: &mut DatagramState, dispatches: &mut Dispatches) {
        if !state.flow.enable_send {
            return;
        }
        loop {
            let fd = match state.socket.as_ref() {
                Some(socket) => raw_fd(socket),
                None => return,
            };
            let entry = match state.send_queue.front() {
                Some(entry) => entry,
                None => break,
            };
            let outcome = match &entry.endpoint {
                Some(endpoint) => net::send_to(fd, &entry.data, endpoint),
                None => {
                    let bufs = [io::IoSlice::new(&entry.data)];
                    net::send_vectored(fd, &bufs, false)
                }
            };
            match outcome {
                Ok(sent) => {
                    let entry = state.send_queue.pop_front().unwrap();
                    self.complete_send_entry(state, entry, sent, dispatches);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    let error = Error::from(err);
                    let entry = state.send_queue.pop_front().unwrap();
                    self.fail_send_entry(state, entry, error, dispatches);
                    self.observe(state, dispatches, move |session| {
                        session.on_error(ErrorEvent { error });
                    });
                }
            }
        }
    }

    fn complete_send_entry(
        &self,
        state: &mut DatagramState,
        mut entry: SendEntry,
        sent: usize,
        dispatches: &mut Dispatches,
    ) {
        if let Some(timer) = entry.timer.take() {
            timer.cancel();
        }
        if let Some(crossing) = state.send_state.remove(entry.data.len()) {
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
            let timestamp = entry.timestamping.then(Instant::now);
            let strand = Arc::clone(&self.strand);
            let defer = !entry.recurse;
            dispatches.push(Box::new(move || {
                let event = SendEvent {
                    kind: EventType::Complete,
                    context: SendContext {
                        bytes_sent: sent,
                        queue,
                        zero_copy_acknowledged: false,
                        timestamp,
                        error: None,
                    },
                };
                let cancelled = SendEvent {
                    kind: EventType::Canceled,
                    context: SendContext {
                        bytes_sent: 0,
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
        state: &mut DatagramState,
        mut entry: SendEntry,
        error: Error,
        dispatches: &mut Dispatches,
    ) {
        if let Some(timer) = entry.timer.take() {
            timer.cancel();
        }
        if let Some(crossing) = state.send_state.remove(entry.data.len()) {
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

    fn send_deadline(&self, id: u64) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            let position = state.send_queue.iter().position(|entry| entry.id == id);
            if let Some(position) = position {
                let entry = state.send_queue.remove(position).unwrap();
                self.fail_send_entry(&mut state, entry, Error::WouldBlockSend, &mut dispatches);
                let _ = self.sync_interest(&mut state);
            }
        }
        run_dispatches(dispatches);
    }

    fn send_cancelled(&self, id: u64) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            let position = state.send_queue.iter().position(|entry| entry.id == id);
            if let Some(position) = position {
                let mut entry = state.send_queue.remove(position).unwrap();
                if let Some(timer) = entry.timer.take() {
                    timer.cancel();
                }
                if let Some(crossing) = state.send_state.remove(entry.data.len()) {
                    let context = state.send_state.context();
                    self.observe(&state, &mut dispatches, move |session| {
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
                let _ = self.sync_interest(&mut state);
            }
        }
        run_dispatches(dispatches);
    }

    fn receive(&self, options: ReceiveOptions, callback: Callback<ReceiveEvent>) -> Result<()> {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            if state.closing || state.open == OpenState::Closed || state.open == OpenState::Default
            {
                return Err(Error::Invalid);
            }

            let id = state.next_op_id;
            state.next_op_id += 1;
            let mut entry = ReceiveEntry {
                id,
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

            if let Some(crossing) = state.receive_state.add(1) {
                let context = state.receive_state.context();
                self.observe(&state, &mut dispatches, move |session| {
                    session.on_watermark(WatermarkEvent {
                        direction: QueueDirection::Receive,
                        kind: crossing,
                        context,
                    });
                });
            }
            state.receive_queue.push_back(entry);
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
        Ok(())
    }

    fn receive_deadline(&self, id: u64) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            let position = state.receive_queue.iter().position(|entry| entry.id == id);
            if let Some(position) = position {
                let mut entry = state.receive_queue.remove(position).unwrap();
                entry.timer = None;
                self.forget_receive(&mut state, &mut dispatches);
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
                self.forget_receive(&mut state, &mut dispatches);
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

    /// Removes one pending receive from the queue accounting.
    fn forget_receive(&self, state: &mut DatagramState, dispatches: &mut Dispatches) {
        if let Some(crossing) = state.receive_state.remove(1) {
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

    fn ensure_attached(&self, state: &mut DatagramState) -> Result<Token> {
        if let Some(token) = state.token {
            return Ok(token);
        }
        let arc: Arc<dyn DriverSocket> = self
            .weak
            .upgrade()
            .expect("datagram inner already released");
        let token = self.driver.attach(arc)?;
        state.token = Some(token);
        Ok(token)
    }

    fn sync_interest(&self, state: &mut DatagramState) -> Result<()> {
        if state.detach != DetachState::Idle || state.socket.is_none() {
            return Ok(());
        }
        let want_read = state.flow.enable_receive && !state.receive_queue.is_empty();
        let want_write = state.flow.enable_send && !state.send_queue.is_empty();
        if !(want_read || want_write) && !state.shown_readable && !state.shown_writable {
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
            debug!("datagram {} closing", self.id);

            let sends: Vec<SendEntry> = state.send_queue.drain(..).collect();
            for mut entry in sends {
                if let Some(timer) = entry.timer.take() {
                    timer.cancel();
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

    fn release(&self, state: &mut DatagramState) {
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
        for callback in callbacks {
            let strand = Arc::clone(&self.strand);
            strand.execute(Box::new(move || {
                callback.fire((), None, false);
            }));
        }
        debug!("datagram {} closed", self.id);
    }
}

impl Drop for DatagramInner {
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

impl DriverSocket for DatagramInner {
    fn handle(&self) -> Handle {
        self.fd.load(Ordering::SeqCst)
    }

    fn process_readable(&self) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            while !state.receive_queue.is_empty() && state.flow.enable_receive {
                let fd = match state.socket.as_ref() {
                    Some(socket) => raw_fd(socket),
                    None => break,
                };
                let max_size = state.receive_queue.front().map(|e| e.max_size).unwrap_or(0);
                let mut buffer = vec![0u8; max_size.max(1)];
                match net::recv_from(fd, &mut buffer) {
                    Ok((n, source)) => {
                        buffer.truncate(n);
                        let mut entry = state.receive_queue.pop_front().unwrap();
                        if let Some(timer) = entry.timer.take() {
                            timer.cancel();
                        }
                        self.forget_receive(&mut state, &mut dispatches);
                        if let Some(callback) = entry.callback.take() {
                            callback.clear_cancel_hook();
                            let queue = state.receive_state.context();
                            let strand = Arc::clone(&self.strand);
                            let defer = !entry.recurse;
                            dispatches.push(Box::new(move || {
                                let event = ReceiveEvent {
                                    kind: EventType::Complete,
                                    context: ReceiveContext {
                                        data: buffer,
                                        endpoint: source,
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
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        let error = Error::from(err);
                        warn!("datagram {} receive failed: {}", self.id, error);
                        self.observe(&state, &mut dispatches, move |session| {
                            session.on_error(ErrorEvent { error });
                        });
                        break;
                    }
                }
            }
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
    }

    fn process_writable(&self) {
        let mut dispatches = Dispatches::new();
        {
            let mut state = self.state.lock();
            self.drain_send_queue(&mut state, &mut dispatches);
            let _ = self.sync_interest(&mut state);
        }
        run_dispatches(dispatches);
    }

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

fn raw_fd(socket: &socket2::Socket) -> i32 {
    use std::os::fd::AsRawFd;
    socket.as_raw_fd()
}
