//! The completion-based engine.
//!
//! Where the reactor reports readiness and lets the socket perform the I/O,
//! the proactor is handed whole operations: it stores the continuation,
//! performs the I/O itself when the handle allows, and delivers the result.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{debug, error, trace};
use parking_lot::Mutex;
use slab::Slab;

use crate::callback::Callback;
use crate::driver::{Backend, Driver, DriverSocket, Handle, WaiterOptions};
use crate::endpoint::Endpoint;
use crate::event::Events;
use crate::strand::{Executor, Strand, Task};
use crate::sys::{self, net};
use crate::timer::{Timer, TimerCallback, TimerOptions, TimerWheel};
use crate::{Error, Interest, Result, Token};

const WAKER: Token = Token(usize::MAX);

/// Configures proactor runtime details.
#[derive(Clone, Debug)]
pub struct ProactorConfig {
    /// The readiness device the completions are bridged over; `None` picks
    /// the platform default.
    pub backend: Option<Backend>,
    pub events_capacity: usize,
}

impl Default for ProactorConfig {
    fn default() -> ProactorConfig {
        ProactorConfig {
            backend: None,
            events_capacity: 1_024,
        }
    }
}

struct ConnectOp {
    callback: Callback<Result<()>>,
}

struct AcceptOp {
    callback: Callback<Result<(OwnedFd, Endpoint)>>,
}

struct SendOp {
    data: Vec<u8>,
    written: usize,
    callback: Callback<Result<usize>>,
}

struct ReceiveOp {
    max_size: usize,
    callback: Callback<Result<Vec<u8>>>,
}

struct Attachment {
    fd: Handle,
    socket: Arc<dyn DriverSocket>,
    detaching: bool,
    // Direction gates driven by show/hide.
    receive_enabled: bool,
    send_enabled: bool,
    connect: Option<ConnectOp>,
    accepts: VecDeque<AcceptOp>,
    sends: VecDeque<SendOp>,
    receives: VecDeque<ReceiveOp>,
    registered: Option<Interest>,
}

impl Attachment {
    fn desired_interest(&self) -> Option<Interest> {
        let mut interest: Option<Interest> = None;
        let wants_read =
            self.receive_enabled && !(self.accepts.is_empty() && self.receives.is_empty());
        let wants_write = self.send_enabled && !(self.connect.is_none() && self.sends.is_empty());
        if wants_read {
            interest = Some(Interest::READABLE);
        }
        if wants_write {
            interest = Some(match interest {
                Some(interest) => interest | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest
    }
}

enum Completion {
    Connect(Callback<Result<()>>, Result<()>),
    Accept(Callback<Result<(OwnedFd, Endpoint)>>, Result<(OwnedFd, Endpoint)>),
    Send(Callback<Result<usize>>, Result<usize>),
    Receive(Callback<Result<Vec<u8>>>, Result<Vec<u8>>),
}

/// A completion-based I/O engine bridged over the platform readiness
/// device.
pub struct Proactor {
    selector: sys::Selector,
    backend: Backend,
    waker: sys::Waker,
    wheel: Mutex<TimerWheel>,
    attachments: Mutex<Slab<Attachment>>,
    pending_detach: Mutex<Vec<Token>>,
    tasks: Mutex<VecDeque<Task>>,
    strand: Arc<Strand>,
    stopping: AtomicBool,
    waiters: AtomicUsize,
    events_capacity: usize,
    weak: Weak<Proactor>,
}

impl Proactor {
    pub fn new(config: ProactorConfig) -> Result<Arc<Proactor>> {
        let backend = config.backend.unwrap_or_else(Backend::default_for_platform);
        let selector = sys::Selector::new(backend).map_err(|err| {
            error!("unable to open {:?} completion device: {}", backend, err);
            Error::from(err)
        })?;
        let waker = sys::Waker::new().map_err(Error::from)?;
        selector
            .register(waker.as_raw_fd(), WAKER, Interest::READABLE)
            .map_err(Error::from)?;

        Ok(Arc::new_cyclic(|weak: &Weak<Proactor>| {
            let executor: Weak<dyn Executor> = weak.clone();
            Proactor {
                selector,
                backend,
                waker,
                wheel: Mutex::new(TimerWheel::new()),
                attachments: Mutex::new(Slab::new()),
                pending_detach: Mutex::new(Vec::new()),
                tasks: Mutex::new(VecDeque::new()),
                strand: Strand::new(executor),
                stopping: AtomicBool::new(false),
                waiters: AtomicUsize::new(0),
                events_capacity: config.events_capacity,
                weak: weak.clone(),
            }
        }))
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Initiates a connect; the continuation observes the outcome.
    pub fn connect(
        &self,
        token: Token,
        endpoint: Endpoint,
        callback: Callback<Result<()>>,
    ) -> Result<()> {
        let mut attachments = self.attachments.lock();
        let fd = {
            let attachment = self.usable(&mut attachments, token)?;
            if attachment.connect.is_some() {
                return Err(Error::Invalid);
            }
            attachment.fd
        };
        let connected = net::with_socket(fd, |socket| net::connect(socket, &endpoint))
            .map_err(Error::from)?;
        if connected {
            drop(attachments);
            callback.complete(Ok(()), Some(&self.strand), false);
            return Ok(());
        }
        let attachment = self.usable(&mut attachments, token)?;
        attachment.connect = Some(ConnectOp { callback });
        self.rearm(token, attachment);
        Ok(())
    }

    /// Queues an accept; the continuation observes the connected handle and
    /// its peer endpoint.
    pub fn accept(&self, token: Token, callback: Callback<Result<(OwnedFd, Endpoint)>>) -> Result<()> {
        let mut attachments = self.attachments.lock();
        let attachment = self.usable(&mut attachments, token)?;
        attachment.accepts.push_back(AcceptOp { callback });
        self.rearm(token, attachment);
        self.interrupt();
        Ok(())
    }

    /// Queues a send of the whole buffer; the continuation observes the
    /// byte count.
    pub fn send(&self, token: Token, data: Vec<u8>, callback: Callback<Result<usize>>) -> Result<()> {
        let mut attachments = self.attachments.lock();
        let attachment = self.usable(&mut attachments, token)?;
        attachment.sends.push_back(SendOp {
            data,
            written: 0,
            callback,
        });
        self.rearm(token, attachment);
        self.interrupt();
        Ok(())
    }

    /// Queues a receive of up to `max_size` bytes; the continuation
    /// observes the data, or `Error::Eof` when the peer shut down.
    pub fn receive(
        &self,
        token: Token,
        max_size: usize,
        callback: Callback<Result<Vec<u8>>>,
    ) -> Result<()> {
        if max_size == 0 {
            return Err(Error::Invalid);
        }
        let mut attachments = self.attachments.lock();
        let attachment = self.usable(&mut attachments, token)?;
        attachment.receives.push_back(ReceiveOp { max_size, callback });
        self.rearm(token, attachment);
        self.interrupt();
        Ok(())
    }

    fn usable<'a>(
        &self,
        attachments: &'a mut Slab<Attachment>,
        token: Token,
    ) -> Result<&'a mut Attachment> {
        let attachment = attachments.get_mut(token.0).ok_or(Error::Invalid)?;
        if attachment.detaching {
            return Err(Error::Invalid);
        }
        Ok(attachment)
    }

    /// Synchronizes the selector with the interest implied by the queued
    /// operations. Callers hold the attachments lock.
    fn rearm(&self, token: Token, attachment: &mut Attachment) {
        let desired = if attachment.detaching {
            None
        } else {
            attachment.desired_interest()
        };
        if desired == attachment.registered {
            return;
        }
        let result = match (attachment.registered, desired) {
            (None, Some(interest)) => self.selector.register(attachment.fd, token, interest),
            (Some(_), Some(interest)) => self.selector.reregister(attachment.fd, token, interest),
            (Some(_), None) => self.selector.deregister(attachment.fd),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => attachment.registered = desired,
            Err(err) => error!("unable to arm completion interest: {}", err),
        }
    }

    fn perform_readable(&self, token: Token, completions: &mut Vec<Completion>) {
        let mut attachments = self.attachments.lock();
        let attachment = match attachments.get_mut(token.0) {
            Some(attachment) if !attachment.detaching => attachment,
            _ => return,
        };
        let fd = attachment.fd;

        while let Some(op) = attachment.accepts.pop_front() {
            match net::with_socket(fd, net::accept) {
                Ok((accepted, peer)) => {
                    completions.push(Completion::Accept(
                        op.callback,
                        Ok((OwnedFd::from(accepted), peer)),
                    ));
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    attachment.accepts.push_front(op);
                    break;
                }
                Err(err) => {
                    completions.push(Completion::Accept(op.callback, Err(Error::from(err))));
                }
            }
        }

        while let Some(op) = attachment.receives.pop_front() {
            let mut data = vec![0u8; op.max_size];
            let mut bufs = [IoSliceMut::new(&mut data)];
            match net::recv_vectored(fd, &mut bufs) {
                Ok(0) => completions.push(Completion::Receive(op.callback, Err(Error::Eof))),
                Ok(n) => {
                    data.truncate(n);
                    completions.push(Completion::Receive(op.callback, Ok(data)));
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    attachment.receives.push_front(op);
                    break;
                }
                Err(err) => {
                    completions.push(Completion::Receive(op.callback, Err(Error::from(err))));
                }
            }
        }

        self.rearm(token, attachment);
    }

    fn perform_writable(&self, token: Token, completions: &mut Vec<Completion>) {
        let mut attachments = self.attachments.lock();
        let attachment = match attachments.get_mut(token.0) {
            Some(attachment) if !attachment.detaching => attachment,
            _ => return,
        };
        let fd = attachment.fd;

        if let Some(op) = attachment.connect.take() {
            let outcome = net::with_socket(fd, net::take_error);
            let result = match outcome {
                Ok(None) => Ok(()),
                Ok(Some(err)) => Err(Error::from(err)),
                Err(err) => Err(Error::from(err)),
            };
            completions.push(Completion::Connect(op.callback, result));
        }

        while let Some(mut op) = attachment.sends.pop_front() {
            let bufs = [IoSlice::new(&op.data[op.written..])];
            match net::send_vectored(fd, &bufs, false) {
                Ok(n) => {
                    op.written += n;
                    if op.written == op.data.len() {
                        let written = op.written;
                        completions.push(Completion::Send(op.callback, Ok(written)));
                    } else {
                        attachment.sends.push_front(op);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    attachment.sends.push_front(op);
                    break;
                }
                Err(err) => {
                    completions.push(Completion::Send(op.callback, Err(Error::from(err))));
                }
            }
        }

        self.rearm(token, attachment);
    }

    fn dispatch(&self, completions: Vec<Completion>) {
        for completion in completions {
            match completion {
                Completion::Connect(callback, result) => {
                    callback.complete(result, Some(&self.strand), false)
                }
                Completion::Accept(callback, result) => {
                    callback.complete(result, Some(&self.strand), false)
                }
                Completion::Send(callback, result) => {
                    callback.complete(result, Some(&self.strand), false)
                }
                Completion::Receive(callback, result) => {
                    callback.complete(result, Some(&self.strand), false)
                }
            }
        }
    }

    /// Fails every queued operation. Used by detach and error paths.
    fn cancel_ops(&self, attachment: &mut Attachment, error: Error) -> Vec<Completion> {
        let mut completions = Vec::new();
        if let Some(op) = attachment.connect.take() {
            completions.push(Completion::Connect(op.callback, Err(error)));
        }
        for op in attachment.accepts.drain(..) {
            completions.push(Completion::Accept(op.callback, Err(error)));
        }
        for op in attachment.sends.drain(..) {
            completions.push(Completion::Send(op.callback, Err(error)));
        }
        for op in attachment.receives.drain(..) {
            completions.push(Completion::Receive(op.callback, Err(error)));
        }
        completions
    }

    fn drain_tasks(&self) {
        loop {
            let task = self.tasks.lock().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    fn complete_detaches(&self) {
        loop {
            let token = match self.pending_detach.lock().pop() {
                Some(token) => token,
                None => break,
            };
            let removed = {
                let mut attachments = self.attachments.lock();
                attachments.try_remove(token.0)
            };
            if let Some(mut attachment) = removed {
                let completions = self.cancel_ops(&mut attachment, Error::Cancelled);
                self.dispatch(completions);
                trace!("detach complete for token {:?}", token);
                attachment.socket.process_detached();
            }
        }
    }

    fn fire_timers(&self) {
        let firings = self.wheel.lock().fire_due(Instant::now());
        for firing in firings {
            firing.dispatch();
        }
    }

    fn run_loop(&self) -> Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);
        while !self.stopping.load(Ordering::SeqCst) {
            self.drain_tasks();
            self.complete_detaches();

            let timeout = {
                let mut wheel = self.wheel.lock();
                wheel
                    .next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            };

            match self.selector.select(&mut events, timeout) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("completion wait failed: {}", err);
                    return Err(Error::from(err));
                }
            }

            let mut completions = Vec::new();
            for event in &events {
                if event.token() == WAKER {
                    self.waker.ack();
                    continue;
                }
                if event.is_readable() {
                    self.perform_readable(event.token(), &mut completions);
                }
                if event.is_writable() || event.is_error() {
                    self.perform_writable(event.token(), &mut completions);
                }
            }
            self.dispatch(completions);

            self.fire_timers();
        }

        self.drain_tasks();
        self.complete_detaches();
        Ok(())
    }
}

impl Executor for Proactor {
    fn execute(&self, task: Task) {
        self.tasks.lock().push_back(task);
        self.interrupt();
    }
}

impl Driver for Proactor {
    fn attach(&self, socket: Arc<dyn DriverSocket>) -> Result<Token> {
        let fd = socket.handle();
        let mut attachments = self.attachments.lock();
        let entry = attachments.vacant_entry();
        let token = Token(entry.key());
        entry.insert(Attachment {
            fd,
            socket,
            detaching: false,
            receive_enabled: true,
            send_enabled: true,
            connect: None,
            accepts: VecDeque::new(),
            sends: VecDeque::new(),
            receives: VecDeque::new(),
            registered: None,
        });
        trace!("attached fd {} as token {:?}", fd, token);
        Ok(token)
    }

    fn detach(&self, token: Token) -> Result<()> {
        {
            let mut attachments = self.attachments.lock();
            let attachment = attachments.get_mut(token.0).ok_or(Error::Invalid)?;
            if attachment.detaching {
                return Ok(());
            }
            attachment.detaching = true;
            if attachment.registered.take().is_some() {
                let _ = self.selector.deregister(attachment.fd);
            }
        }
        self.pending_detach.lock().push(token);
        if self.waiters.load(Ordering::SeqCst) == 0 {
            self.complete_detaches();
        } else {
            self.interrupt();
        }
        Ok(())
    }

    /// For a completion engine, showing a direction resumes harvesting the
    /// operations queued in that direction.
    fn show(&self, token: Token, interest: Interest) -> Result<()> {
        let mut attachments = self.attachments.lock();
        let attachment = self.usable(&mut attachments, token)?;
        if interest.is_readable() {
            attachment.receive_enabled = true;
        }
        if interest.is_writable() {
            attachment.send_enabled = true;
        }
        self.rearm(token, attachment);
        Ok(())
    }

    fn hide(&self, token: Token, interest: Interest) -> Result<()> {
        let mut attachments = self.attachments.lock();
        let attachment = attachments.get_mut(token.0).ok_or(Error::Invalid)?;
        if interest.is_readable() {
            attachment.receive_enabled = false;
        }
        if interest.is_writable() {
            attachment.send_enabled = false;
        }
        self.rearm(token, attachment);
        Ok(())
    }

    fn add_timer(&self, options: TimerOptions, session: TimerCallback) -> Result<Timer> {
        let id = self.wheel.lock().add(options, session);
        self.interrupt();
        let driver: Weak<dyn Driver> = self.weak.clone();
        Ok(Timer::new(id, driver))
    }

    fn remove_timer(&self, id: usize) -> bool {
        match self.wheel.lock().cancel(id) {
            Some(firing) => {
                firing.dispatch();
                true
            }
            None => false,
        }
    }

    fn run(&self, waiter: &WaiterOptions) -> Result<()> {
        let name = waiter.name.as_deref().unwrap_or("waiter");
        debug!("{} entering {:?} completion loop", name, self.backend);
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let result = self.run_loop();
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        if self.stopping.load(Ordering::SeqCst) {
            let _ = self.waker.wake();
        }
        debug!("{} left completion loop", name);
        result
    }

    fn interrupt(&self) {
        let _ = self.waker.wake();
    }

    fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let firings = self.wheel.lock().close_all();
        for firing in firings {
            firing.dispatch();
        }
        self.interrupt();
    }

    fn strand(&self) -> Arc<Strand> {
        Arc::clone(&self.strand)
    }

    fn new_strand(&self) -> Arc<Strand> {
        let executor: Weak<dyn Executor> = self.weak.clone();
        Strand::new(executor)
    }
}

impl std::fmt::Debug for Proactor {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Proactor")
            .field("backend", &self.backend)
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish()
    }
}
