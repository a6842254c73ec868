//! The interface: threads bound to an engine, plus object factories.

use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::driver::{Backend, Driver, WaiterOptions};
use crate::reactor::{Reactor, ReactorConfig};
use crate::reservation::Reservation;
use crate::resolver::{Resolver, ResolverConfig};
use crate::socket::options::SocketOptions;
use crate::socket::{DatagramSocket, ListenerSocket, StreamSocket};
use crate::timer::{Timer, TimerCallback, TimerOptions};
use crate::Result;

/// Configures an [`Interface`].
#[derive(Clone, Debug)]
pub struct InterfaceConfig {
    /// Threads driving the engine's run loop.
    pub thread_count: usize,
    /// Readiness back-end; `None` picks the platform default.
    pub backend: Option<Backend>,
    /// Ceiling on concurrently open socket handles; `None` is unlimited.
    pub handle_limit: Option<usize>,
    /// Resolver configuration; `None` loads the system configuration.
    pub resolver: Option<ResolverConfig>,
}

impl Default for InterfaceConfig {
    fn default() -> InterfaceConfig {
        InterfaceConfig {
            thread_count: 1,
            backend: None,
            handle_limit: None,
            resolver: None,
        }
    }
}

/// Binds a pool of threads to one engine and creates the sockets, timers,
/// and resolver running on it.
pub struct Interface {
    driver: Arc<Reactor>,
    reservation: Option<Arc<Reservation>>,
    resolver: Arc<Resolver>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Interface {
    pub fn new(config: InterfaceConfig) -> Result<Interface> {
        let driver = Reactor::new(ReactorConfig {
            backend: config.backend,
            ..ReactorConfig::default()
        })?;
        let reservation = config.handle_limit.map(|limit| Arc::new(Reservation::new(limit)));
        let resolver = match config.resolver {
            Some(resolver_config) => Resolver::new(resolver_config),
            None => Resolver::system(),
        };

        let mut threads = Vec::with_capacity(config.thread_count.max(1));
        for index in 0..config.thread_count.max(1) {
            let driver = Arc::clone(&driver);
            let name = format!("netio-{}", index);
            let waiter = WaiterOptions {
                name: Some(name.clone()),
            };
            threads.push(
                thread::Builder::new()
                    .name(name)
                    .spawn(move || {
                        if let Err(error) = driver.run(&waiter) {
                            warn!("engine thread stopped with {}", error);
                        }
                    })
                    .expect("unable to spawn engine thread"),
            );
        }
        debug!("interface started with {} thread(s)", threads.len());

        Ok(Interface {
            driver,
            reservation,
            resolver,
            threads: Mutex::new(threads),
        })
    }

    /// The engine the interface's threads drive.
    pub fn driver(&self) -> Arc<dyn Driver> {
        Arc::clone(&self.driver) as Arc<dyn Driver>
    }

    pub fn reactor(&self) -> Arc<Reactor> {
        Arc::clone(&self.driver)
    }

    pub fn resolver(&self) -> Arc<Resolver> {
        Arc::clone(&self.resolver)
    }

    /// Creates a stream socket wired to this interface's engine, resolver,
    /// and handle reservation.
    pub fn create_stream_socket(&self, options: SocketOptions) -> StreamSocket {
        let socket = StreamSocket::with_options(self.driver(), options);
        socket.set_resolver(Arc::clone(&self.resolver));
        if let Some(reservation) = &self.reservation {
            socket.set_reservation(Arc::clone(reservation));
        }
        socket
    }

    /// Creates a listener socket; accepted connections are charged against
    /// the interface's handle reservation.
    pub fn create_listener_socket(&self, options: SocketOptions) -> ListenerSocket {
        let socket = ListenerSocket::with_options(self.driver(), options);
        if let Some(reservation) = &self.reservation {
            socket.set_reservation(Arc::clone(reservation));
        }
        socket
    }

    pub fn create_datagram_socket(&self, options: SocketOptions) -> DatagramSocket {
        let socket = DatagramSocket::with_options(self.driver(), options);
        if let Some(reservation) = &self.reservation {
            socket.set_reservation(Arc::clone(reservation));
        }
        socket
    }

    /// Schedules a timer on the interface's engine.
    pub fn create_timer(&self, options: TimerOptions, session: TimerCallback) -> Result<Timer> {
        self.driver.add_timer(options, session)
    }

    /// Stops the engine, waits for the pool to drain, and shuts down the
    /// resolver.
    pub fn shutdown(&self) {
        self.driver.stop();
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            let _ = thread.join();
        }
        self.resolver.shutdown();
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Interface")
            .field("threads", &self.threads.lock().len())
            .field("backend", &self.driver.backend())
            .finish()
    }
}
