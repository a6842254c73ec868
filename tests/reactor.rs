use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use netio::{
    Backend, Driver, DriverSocket, Executor, Handle, Interest, Reactor, ReactorConfig,
    WaiterOptions,
};

mod util;

use util::{init, DELIVERY};

/// A bare engine attachment: records readiness callbacks onto a channel.
struct Probe {
    fd: Handle,
    readable: std::sync::mpsc::Sender<()>,
    detached: std::sync::mpsc::Sender<()>,
}

impl DriverSocket for Probe {
    fn handle(&self) -> Handle {
        self.fd
    }

    fn process_readable(&self) {
        let _ = self.readable.send(());
    }

    fn process_writable(&self) {}

    fn process_error(&self) {}

    fn process_detached(&self) {
        let _ = self.detached.send(());
    }
}

fn spawn_waiter(reactor: &Arc<Reactor>) -> thread::JoinHandle<()> {
    let reactor = Arc::clone(reactor);
    thread::spawn(move || {
        let _ = reactor.run(&WaiterOptions {
            name: Some("test-waiter".into()),
        });
    })
}

/// A blocked waiter returns promptly once the engine is asked to stop.
#[test]
fn stop_wakes_a_blocked_waiter() {
    init();
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let handle = spawn_waiter(&reactor);

    // Let the waiter reach the blocking wait, then interrupt it.
    thread::sleep(Duration::from_millis(50));
    let asked = Instant::now();
    reactor.stop();
    handle.join().expect("waiter panicked");
    assert!(
        asked.elapsed() < Duration::from_secs(2),
        "waiter took {:?} to observe the stop",
        asked.elapsed()
    );
}

#[test]
fn execute_runs_deferred_functors() {
    init();
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let handle = spawn_waiter(&reactor);

    let count = Arc::new(AtomicUsize::new(0));
    let (done, finished) = channel();
    for _ in 0..10 {
        let count = Arc::clone(&count);
        let done = done.clone();
        reactor.execute(Box::new(move || {
            if count.fetch_add(1, Ordering::SeqCst) == 9 {
                let _ = done.send(());
            }
        }));
    }
    finished.recv_timeout(DELIVERY).expect("functors not drained");
    assert_eq!(count.load(Ordering::SeqCst), 10);

    reactor.stop();
    handle.join().unwrap();
}

fn readiness_roundtrip(backend: Backend) {
    let reactor = match Reactor::new(ReactorConfig {
        backend: Some(backend),
        ..ReactorConfig::default()
    }) {
        Ok(reactor) => reactor,
        // Back-end absent on this platform.
        Err(_) => return,
    };
    let handle = spawn_waiter(&reactor);

    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver.set_nonblocking(true).unwrap();
    let address = receiver.local_addr().unwrap();

    let (readable_tx, readable) = channel();
    let (detached_tx, detached) = channel();
    let probe = Arc::new(Probe {
        fd: receiver.as_raw_fd(),
        readable: readable_tx,
        detached: detached_tx,
    });
    let token = reactor.attach(probe).unwrap();
    reactor.show(token, Interest::READABLE).unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"ping", address).unwrap();

    readable
        .recv_timeout(DELIVERY)
        .unwrap_or_else(|_| panic!("{:?} backend never reported readiness", backend));

    // Hiding the interest stops delivery; the datagram stays queued.
    reactor.hide(token, Interest::READABLE).unwrap();
    // Let any dispatch already past the interest gate land first.
    thread::sleep(Duration::from_millis(100));
    while readable.try_recv().is_ok() {}
    sender.send_to(b"ping", address).unwrap();
    assert!(
        readable.recv_timeout(Duration::from_millis(200)).is_err(),
        "{:?} backend delivered readiness while hidden",
        backend
    );

    // Detach completes through the engine with a detach callback.
    reactor.detach(token).unwrap();
    detached
        .recv_timeout(DELIVERY)
        .unwrap_or_else(|_| panic!("{:?} backend never completed the detach", backend));

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn readiness_roundtrip_on_default_backend() {
    init();
    readiness_roundtrip(Backend::default_for_platform());
}

#[test]
fn readiness_roundtrip_on_poll_backend() {
    init();
    readiness_roundtrip(Backend::Poll);
}

#[test]
fn readiness_roundtrip_on_select_backend() {
    init();
    readiness_roundtrip(Backend::Select);
}

/// Edge triggering is honored where the back-end supports it and refused
/// where it cannot be.
#[test]
fn edge_interest_support_follows_the_backend() {
    init();
    let default = Reactor::new(ReactorConfig::default()).unwrap();
    let poll = Reactor::new(ReactorConfig {
        backend: Some(Backend::Poll),
        ..ReactorConfig::default()
    })
    .unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_nonblocking(true).unwrap();
    let (readable_tx, _readable) = channel();
    let (detached_tx, _detached) = channel();
    let probe = Arc::new(Probe {
        fd: socket.as_raw_fd(),
        readable: readable_tx,
        detached: detached_tx,
    });

    let token = poll.attach(Arc::clone(&probe) as Arc<dyn DriverSocket>).unwrap();
    assert_eq!(
        poll.show(token, Interest::READABLE | Interest::EDGE),
        Err(netio::Error::NotImplemented)
    );

    if default.supports_edge() {
        let token = default.attach(probe).unwrap();
        default
            .show(token, Interest::READABLE | Interest::EDGE)
            .expect("edge registration failed on an edge-capable backend");
    }
}
