//! The readiness-based engine.

use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{debug, error, trace};
use parking_lot::Mutex;
use slab::Slab;

use crate::driver::{Backend, Driver, DriverSocket, Handle, WaiterOptions};
use crate::event::Events;
use crate::strand::{Executor, Strand, Task};
use crate::sys;
use crate::timer::{Timer, TimerCallback, TimerOptions, TimerWheel};
use crate::{Error, Interest, Result, Token};

// Token used to represent the wakeup handle.
const WAKER: Token = Token(usize::MAX);

/// Configures reactor runtime details.
#[derive(Clone, Debug)]
pub struct ReactorConfig {
    /// The readiness device; `None` picks the platform default.
    pub backend: Option<Backend>,
    /// At most this many events are harvested per wait; further pending
    /// events are returned by the next wait.
    pub events_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> ReactorConfig {
        ReactorConfig {
            backend: None,
            events_capacity: 1_024,
        }
    }
}

struct Attachment {
    fd: Handle,
    socket: Arc<dyn DriverSocket>,
    // Interest currently shown to the selector; `None` when hidden.
    interest: Option<Interest>,
    detaching: bool,
}

/// A readiness-based I/O engine.
///
/// Threads drive the reactor by calling [`Driver::run`]; sockets attach,
/// show interest, and perform their own I/O when the reactor reports
/// readiness. A wakeup handle registered alongside the sockets makes
/// [`Driver::interrupt`] abort an in-flight wait promptly.
pub struct Reactor {
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
    weak: Weak<Reactor>,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Result<Arc<Reactor>> {
        let backend = config.backend.unwrap_or_else(Backend::default_for_platform);
        let selector = sys::Selector::new(backend).map_err(|err| {
            error!("unable to open {:?} readiness device: {}", backend, err);
            Error::from(err)
        })?;
        let waker = sys::Waker::new().map_err(Error::from)?;
        selector
            .register(waker.as_raw_fd(), WAKER, Interest::READABLE)
            .map_err(Error::from)?;

        Ok(Arc::new_cyclic(|weak: &Weak<Reactor>| {
            let executor: Weak<dyn Executor> = weak.clone();
            Reactor {
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

    /// The readiness device the reactor was built on.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// True when the back-end honors `Interest::EDGE`.
    pub fn supports_edge(&self) -> bool {
        self.selector.supports_edge()
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
            let socket = {
                let mut attachments = self.attachments.lock();
                attachments.try_remove(token.0).map(|a| a.socket)
            };
            if let Some(socket) = socket {
                trace!("detach complete for token {:?}", token);
                socket.process_detached();
            }
        }
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        let firings = self.wheel.lock().fire_due(now);
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
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("readiness wait failed: {}", err);
                    return Err(Error::from(err));
                }
            }

            for event in &events {
                if event.token() == WAKER {
                    self.waker.ack();
                    continue;
                }
                let dispatch = {
                    let attachments = self.attachments.lock();
                    attachments
                        .get(event.token().0)
                        .filter(|a| !a.detaching)
                        .map(|a| (Arc::clone(&a.socket), a.interest))
                };
                let (socket, interest) = match dispatch {
                    Some(found) => found,
                    // Detached between harvest and dispatch; drop the event.
                    None => continue,
                };
                trace!("dispatching {:?}", event);
                if event.is_notifications()
                    && interest.map_or(false, |i| i.is_notifications())
                {
                    socket.process_notifications();
                }
                if event.is_error() {
                    socket.process_error();
                }
                if event.is_readable() && interest.map_or(false, |i| i.is_readable()) {
                    socket.process_readable();
                }
                if event.is_writable() && interest.map_or(false, |i| i.is_writable()) {
                    socket.process_writable();
                }
            }

            self.fire_timers();
        }

        // Drain outstanding completions before the waiter leaves.
        self.drain_tasks();
        self.complete_detaches();
        Ok(())
    }
}

impl Executor for Reactor {
    fn execute(&self, task: Task) {
        self.tasks.lock().push_back(task);
        self.interrupt();
    }
}

impl Driver for Reactor {
    fn attach(&self, socket: Arc<dyn DriverSocket>) -> Result<Token> {
        let fd = socket.handle();
        let mut attachments = self.attachments.lock();
        let entry = attachments.vacant_entry();
        let token = Token(entry.key());
        entry.insert(Attachment {
            fd,
            socket,
            interest: None,
            detaching: false,
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
            if attachment.interest.take().is_some() {
                let _ = self.selector.deregister(attachment.fd);
            }
        }
        self.pending_detach.lock().push(token);
        if self.waiters.load(Ordering::SeqCst) == 0 {
            // No run loop to observe the request; complete it here.
            self.complete_detaches();
        } else {
            self.interrupt();
        }
        Ok(())
    }

    fn show(&self, token: Token, interest: Interest) -> Result<()> {
        let mut attachments = self.attachments.lock();
        let attachment = attachments.get_mut(token.0).ok_or(Error::Invalid)?;
        if attachment.detaching {
            return Err(Error::Invalid);
        }
        let combined = match attachment.interest {
            Some(current) => current | interest,
            None => interest,
        };
        let result = match attachment.interest {
            Some(_) => self.selector.reregister(attachment.fd, token, combined),
            None => self.selector.register(attachment.fd, token, combined),
        };
        match result {
            Ok(()) => {
                attachment.interest = Some(combined);
                Ok(())
            }
            Err(err) => Err(Error::from(err)),
        }
    }

    fn hide(&self, token: Token, interest: Interest) -> Result<()> {
        let mut attachments = self.attachments.lock();
        let attachment = attachments.get_mut(token.0).ok_or(Error::Invalid)?;
        let current = match attachment.interest {
            Some(current) => current,
            None => return Ok(()),
        };
        match current.remove(interest) {
            Some(remaining) => {
                self.selector
                    .reregister(attachment.fd, token, remaining)
                    .map_err(Error::from)?;
                attachment.interest = Some(remaining);
            }
            None => {
                let _ = self.selector.deregister(attachment.fd);
                attachment.interest = None;
            }
        }
        Ok(())
    }

    fn add_timer(&self, options: TimerOptions, session: TimerCallback) -> Result<Timer> {
        let id = self.wheel.lock().add(options, session);
        // The new deadline may be earlier than the one the poll is waiting
        // on.
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
        debug!("{} entering {:?} run loop", name, self.backend);
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let result = self.run_loop();
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        if self.stopping.load(Ordering::SeqCst) {
            // Cascade the wakeup so sibling waiters observe the stop.
            let _ = self.waker.wake();
        }
        debug!("{} left run loop", name);
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

impl std::fmt::Debug for Reactor {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Reactor")
            .field("backend", &self.backend)
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish()
    }
}
