use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use netio::{
    Driver, DriverSocket, Endpoint, FutureResult, Handle, Proactor, ProactorConfig,
    TimerEventType, TimerOptions, WaiterOptions,
};

mod util;

use util::{init, DELIVERY};

/// The proactor only needs the identity and detach surfaces of an
/// attachment; completions flow through the stored continuations.
struct Port {
    fd: Handle,
}

impl DriverSocket for Port {
    fn handle(&self) -> Handle {
        self.fd
    }

    fn process_readable(&self) {}

    fn process_writable(&self) {}

    fn process_error(&self) {}

    fn process_detached(&self) {}
}

fn spawn_waiter(proactor: &Arc<Proactor>) -> thread::JoinHandle<()> {
    let proactor = Arc::clone(proactor);
    thread::spawn(move || {
        let _ = proactor.run(&WaiterOptions {
            name: Some("proactor-waiter".into()),
        });
    })
}

/// Echo through completion-returning operations: the engine performs every
/// accept, receive, and send itself and hands back the results.
#[test]
fn completion_echo() {
    init();
    let proactor = Proactor::new(ProactorConfig::default()).unwrap();
    let waiter = spawn_waiter(&proactor);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let address = listener.local_addr().unwrap();

    let listener_token = proactor
        .attach(Arc::new(Port {
            fd: listener.as_raw_fd(),
        }))
        .unwrap();

    let (accepted, accept_cb) = FutureResult::<netio::Result<(OwnedFd, Endpoint)>>::new();
    proactor.accept(listener_token, accept_cb).unwrap();

    // A plain blocking client on the other side.
    let mut client = TcpStream::connect(address).unwrap();

    let (server_fd, peer) = accepted
        .wait_timeout(DELIVERY)
        .expect("accept never completed")
        .expect("accept failed");
    assert!(peer.is_ip());

    let server = socket2::Socket::from(server_fd);
    server.set_nonblocking(true).unwrap();
    let server_token = proactor
        .attach(Arc::new(Port {
            fd: server.as_raw_fd(),
        }))
        .unwrap();

    use std::io::{Read, Write};
    client.write_all(b"hello").unwrap();

    let (received, receive_cb) = FutureResult::new();
    proactor.receive(server_token, 64, receive_cb).unwrap();
    let data = received
        .wait_timeout(DELIVERY)
        .expect("receive never completed")
        .expect("receive failed");
    assert_eq!(data, b"hello");

    let (sent, send_cb) = FutureResult::new();
    proactor.send(server_token, data, send_cb).unwrap();
    assert_eq!(
        sent.wait_timeout(DELIVERY)
            .expect("send never completed")
            .expect("send failed"),
        5
    );

    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello");

    // Detach drains and cancels whatever is still queued.
    let (stuck, stuck_cb) = FutureResult::<netio::Result<Vec<u8>>>::new();
    proactor.receive(server_token, 64, stuck_cb).unwrap();
    proactor.detach(server_token).unwrap();
    assert_eq!(
        stuck.wait_timeout(DELIVERY).expect("cancel never delivered"),
        Err(netio::Error::Cancelled)
    );

    proactor.detach(listener_token).unwrap();
    proactor.stop();
    waiter.join().unwrap();
}

/// Connect through the completion surface.
#[test]
fn completion_connect() {
    init();
    let proactor = Proactor::new(ProactorConfig::default()).unwrap();
    let waiter = spawn_waiter(&proactor);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address: Endpoint = listener.local_addr().unwrap().into();

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .unwrap();
    socket.set_nonblocking(true).unwrap();
    let token = proactor
        .attach(Arc::new(Port {
            fd: socket.as_raw_fd(),
        }))
        .unwrap();

    let (connected, connect_cb) = FutureResult::new();
    proactor.connect(token, address, connect_cb).unwrap();
    connected
        .wait_timeout(DELIVERY)
        .expect("connect never completed")
        .expect("connect failed");

    let (peer, _) = listener.accept().unwrap();
    drop(peer);

    proactor.detach(token).unwrap();
    proactor.stop();
    waiter.join().unwrap();
}

/// Timers ride the same engine contract on the proactor.
#[test]
fn proactor_timers_fire() {
    init();
    let proactor = Proactor::new(ProactorConfig::default()).unwrap();
    let waiter = spawn_waiter(&proactor);

    let (sender, receiver) = channel();
    let session: netio::TimerCallback = Arc::new(move |event| {
        let _ = sender.send(event);
    });
    proactor
        .add_timer(
            TimerOptions::once(Instant::now() + Duration::from_millis(20)),
            session,
        )
        .unwrap();

    let event = receiver.recv_timeout(DELIVERY).expect("timer never fired");
    assert_eq!(event.kind, TimerEventType::Deadline);

    proactor.stop();
    waiter.join().unwrap();
}
