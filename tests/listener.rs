use std::time::{Duration, Instant};

use netio::socket::event::EventType;
use netio::socket::options::{AcceptOptions, ConnectOptions};
use netio::{Endpoint, Error, FutureResult, Interface, InterfaceConfig};

mod util;

use util::{init, DELIVERY};

#[test]
fn accept_deadline_fires() {
    init();
    let interface = Interface::new(InterfaceConfig::default()).unwrap();
    let listener = interface.create_listener_socket(Default::default());
    listener
        .bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap())
        .unwrap();
    listener.listen(8).unwrap();

    let (expired, callback) = FutureResult::new();
    listener
        .accept(
            AcceptOptions {
                deadline: Some(Instant::now() + Duration::from_millis(30)),
                ..AcceptOptions::default()
            },
            callback,
        )
        .unwrap();
    let event = expired.wait_timeout(DELIVERY).expect("deadline stuck");
    assert_eq!(event.kind, EventType::Deadline);
    assert!(event.socket.is_none());

    listener.close(None);
    interface.shutdown();
}

#[test]
fn accept_cancellation() {
    init();
    let interface = Interface::new(InterfaceConfig::default()).unwrap();
    let listener = interface.create_listener_socket(Default::default());
    listener
        .bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap())
        .unwrap();
    listener.listen(8).unwrap();

    let (cancelled, callback) = FutureResult::new();
    let token = callback.cancellation();
    listener.accept(AcceptOptions::default(), callback).unwrap();
    assert!(token.abort());
    let event = cancelled.wait_timeout(DELIVERY).expect("cancel stuck");
    assert_eq!(event.kind, EventType::Canceled);
    assert_eq!(event.context.error, Some(Error::Cancelled));

    listener.close(None);
    interface.shutdown();
}

/// A saturated handle reservation refuses the connection and completes the
/// queued accept with `Limit`.
#[test]
fn handle_limit_refuses_accepted_connections() {
    init();
    let interface = Interface::new(InterfaceConfig {
        // Listener + client already consume nothing from the limit here;
        // the accepted connection would be the first charge.
        handle_limit: Some(0),
        ..InterfaceConfig::default()
    })
    .unwrap();

    let listener = interface.create_listener_socket(Default::default());
    listener
        .bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap())
        .unwrap();
    listener.listen(8).unwrap();
    let address = listener.local_endpoint().unwrap();

    let (accepted, accept_cb) = FutureResult::new();
    listener.accept(AcceptOptions::default(), accept_cb).unwrap();

    // Connect with a plain socket so the client side is not charged
    // against the same reservation.
    let client = std::net::TcpStream::connect(match address {
        Endpoint::V4(addr) => addr,
        ref other => panic!("unexpected endpoint family: {}", other),
    })
    .expect("unable to connect");

    let event = accepted.wait_timeout(DELIVERY).expect("accept stuck");
    assert_eq!(event.kind, EventType::Error);
    assert_eq!(event.context.error, Some(Error::Limit));
    assert!(event.socket.is_none());

    drop(client);
    listener.close(None);
    interface.shutdown();
}

#[test]
fn listen_requires_a_bound_handle() {
    init();
    let interface = Interface::new(InterfaceConfig::default()).unwrap();
    let listener = interface.create_listener_socket(Default::default());
    assert_eq!(listener.listen(8), Err(Error::Invalid));

    // Accept before listen is refused as well.
    let (_ignored, callback) = FutureResult::new();
    assert_eq!(
        listener.accept(AcceptOptions::default(), callback),
        Err(Error::Invalid)
    );

    listener.close(None);
    interface.shutdown();
}

#[test]
fn queued_accepts_complete_in_order() {
    init();
    let interface = Interface::new(InterfaceConfig::default()).unwrap();
    let listener = interface.create_listener_socket(Default::default());
    listener
        .bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap())
        .unwrap();
    listener.listen(16).unwrap();
    let address = listener.local_endpoint().unwrap();

    let mut accepts = Vec::new();
    for _ in 0..3 {
        let (future, callback) = FutureResult::new();
        listener.accept(AcceptOptions::default(), callback).unwrap();
        accepts.push(future);
    }

    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = interface.create_stream_socket(Default::default());
        let (connected, connect_cb) = FutureResult::new();
        client
            .connect(address.clone(), ConnectOptions::default(), connect_cb)
            .unwrap();
        connected.wait_timeout(DELIVERY).expect("connect stuck");
        clients.push(client);
    }

    for future in accepts {
        let event = future.wait_timeout(DELIVERY).expect("accept stuck");
        assert_eq!(event.kind, EventType::Complete);
        let socket = event.socket.expect("accept without socket");
        socket.close(None);
    }

    for client in clients {
        client.close(None);
    }
    listener.close(None);
    interface.shutdown();
}
