use std::time::{Duration, Instant};

use netio::socket::event::EventType;
use netio::socket::options::{
    AcceptOptions, ConnectOptions, ReceiveOptions, SendOptions, ShutdownMode, ShutdownType,
};
use netio::{
    Backend, Endpoint, Error, FutureResult, Interface, InterfaceConfig, ListenerSocket,
    StreamSocket,
};

mod util;

use util::{init, DELIVERY};

fn interface_with(backend: Option<Backend>) -> Interface {
    Interface::new(InterfaceConfig {
        thread_count: 2,
        backend,
        ..InterfaceConfig::default()
    })
    .expect("unable to start interface")
}

/// Listener on an ephemeral loopback port plus a connected client/server
/// stream pair.
fn connected_pair(interface: &Interface) -> (ListenerSocket, StreamSocket, StreamSocket) {
    let listener = interface.create_listener_socket(Default::default());
    listener
        .bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap())
        .expect("unable to bind listener");
    listener.listen(128).expect("unable to listen");
    let address = listener.local_endpoint().unwrap();

    let (accepted, accept_cb) = FutureResult::new();
    listener
        .accept(AcceptOptions::default(), accept_cb)
        .expect("unable to queue accept");

    let client = interface.create_stream_socket(Default::default());
    let (connected, connect_cb) = FutureResult::new();
    client
        .connect(address, ConnectOptions::default(), connect_cb)
        .expect("unable to start connect");

    let connect_event = connected
        .wait_timeout(DELIVERY)
        .expect("connect did not complete");
    assert_eq!(connect_event.kind, EventType::Complete);

    let accept_event = accepted
        .wait_timeout(DELIVERY)
        .expect("accept did not complete");
    assert_eq!(accept_event.kind, EventType::Complete);
    let server = accept_event.socket.expect("no socket in accept event");

    (listener, client, server)
}

fn echo_once(interface: &Interface) {
    let (listener, client, server) = connected_pair(interface);

    // Server echoes whatever arrives.
    let (server_got, server_receive_cb) = FutureResult::new();
    server
        .receive(ReceiveOptions::default(), server_receive_cb)
        .unwrap();

    let (client_sent, client_send_cb) = FutureResult::new();
    client
        .send(
            b"hello".to_vec(),
            SendOptions::default(),
            Some(client_send_cb),
        )
        .unwrap();
    let send_event = client_sent.wait_timeout(DELIVERY).expect("send stuck");
    assert_eq!(send_event.kind, EventType::Complete);
    assert_eq!(send_event.context.bytes_sent, 5);

    let receive_event = server_got.wait_timeout(DELIVERY).expect("receive stuck");
    assert_eq!(receive_event.kind, EventType::Complete);
    assert_eq!(receive_event.context.data, b"hello");

    server
        .send(receive_event.context.data, SendOptions::default(), None)
        .unwrap();

    let (client_got, client_receive_cb) = FutureResult::new();
    client
        .receive(
            ReceiveOptions {
                min_size: 5,
                ..ReceiveOptions::default()
            },
            client_receive_cb,
        )
        .unwrap();
    let echoed = client_got.wait_timeout(DELIVERY).expect("echo stuck");
    assert_eq!(echoed.kind, EventType::Complete);
    assert_eq!(echoed.context.data, b"hello");

    // Both sides close; close completions fire exactly once each.
    let (client_closed, client_close_cb) = FutureResult::new();
    client.close(Some(client_close_cb));
    client_closed.wait_timeout(DELIVERY).expect("client close stuck");

    let (server_closed, server_close_cb) = FutureResult::new();
    server.close(Some(server_close_cb));
    server_closed.wait_timeout(DELIVERY).expect("server close stuck");

    listener.close(None);
}

#[test]
fn echo() {
    init();
    let interface = interface_with(None);
    echo_once(&interface);
    interface.shutdown();
}

#[test]
fn echo_over_poll_backend() {
    init();
    let interface = interface_with(Some(Backend::Poll));
    echo_once(&interface);
    interface.shutdown();
}

#[test]
fn echo_over_select_backend() {
    init();
    let interface = interface_with(Some(Backend::Select));
    echo_once(&interface);
    interface.shutdown();
}

#[test]
fn connect_timeout() {
    init();
    let interface = interface_with(None);
    let client = interface.create_stream_socket(Default::default());

    let submitted = Instant::now();
    let (done, callback) = FutureResult::new();
    client
        .connect(
            // TEST-NET-2: packets go nowhere.
            "198.51.100.1:9".parse().unwrap(),
            ConnectOptions {
                deadline: Some(submitted + Duration::from_millis(50)),
                ..ConnectOptions::default()
            },
            callback,
        )
        .unwrap();

    let event = done.wait_timeout(DELIVERY).expect("connect never resolved");
    let elapsed = submitted.elapsed();
    assert_eq!(event.kind, EventType::Error);
    match event.context.error {
        Some(Error::WouldBlockConnect) => {
            assert!(elapsed >= Duration::from_millis(50), "fired early: {:?}", elapsed);
            assert!(elapsed <= Duration::from_secs(2), "fired late: {:?}", elapsed);
        }
        // Environments that answer TEST-NET with an immediate ICMP error
        // classify differently; single completion still holds.
        Some(Error::Unreachable) | Some(Error::ConnectionRefused) => {}
        other => panic!("unexpected connect error: {:?}", other),
    }

    client.close(None);
    interface.shutdown();
}

#[test]
fn cancel_receive() {
    init();
    let interface = interface_with(None);
    let (listener, client, server) = connected_pair(&interface);

    // The peer never writes.
    let (done, callback) = FutureResult::new();
    let token = callback.cancellation();
    client.receive(ReceiveOptions::default(), callback).unwrap();

    std::thread::sleep(Duration::from_millis(10));
    assert!(token.abort(), "abort should win against a silent peer");

    let event = done.wait_timeout(DELIVERY).expect("cancel not delivered");
    assert_eq!(event.kind, EventType::Canceled);
    assert_eq!(event.context.error, Some(Error::Cancelled));

    // A losing second abort changes nothing.
    assert!(!token.abort());

    drop(server);
    client.close(None);
    listener.close(None);
    interface.shutdown();
}

#[test]
fn receive_deadline_fires() {
    init();
    let interface = interface_with(None);
    let (listener, client, _server) = connected_pair(&interface);

    let (done, callback) = FutureResult::new();
    client
        .receive(
            ReceiveOptions {
                deadline: Some(Instant::now() + Duration::from_millis(30)),
                ..ReceiveOptions::default()
            },
            callback,
        )
        .unwrap();
    let event = done.wait_timeout(DELIVERY).expect("deadline not delivered");
    assert_eq!(event.kind, EventType::Deadline);
    assert_eq!(event.context.error, Some(Error::WouldBlockReceive));

    client.close(None);
    listener.close(None);
    interface.shutdown();
}

#[test]
fn close_is_idempotent() {
    init();
    let interface = interface_with(None);
    let (listener, client, server) = connected_pair(&interface);

    let (first, first_cb) = FutureResult::new();
    client.close(Some(first_cb));
    first.wait_timeout(DELIVERY).expect("first close stuck");

    // The second close's callback still fires.
    let (second, second_cb) = FutureResult::new();
    client.close(Some(second_cb));
    second.wait_timeout(DELIVERY).expect("second close stuck");

    server.close(None);
    listener.close(None);
    interface.shutdown();
}

#[test]
fn graceful_shutdown_drains_the_send_queue() {
    init();
    let interface = interface_with(None);
    let (listener, client, server) = connected_pair(&interface);

    let payload: Vec<u8> = (0..256 * 1024).map(|_| rand::random()).collect();
    let (sent, send_cb) = FutureResult::new();
    client
        .send(
            payload.clone(),
            SendOptions {
                force: true,
                ..SendOptions::default()
            },
            Some(send_cb),
        )
        .unwrap();
    client
        .shutdown(ShutdownType::Send, ShutdownMode::Graceful)
        .unwrap();

    // Everything queued before the shutdown still arrives, then EOF.
    let mut collected = Vec::new();
    while collected.len() < payload.len() {
        let (chunk, receive_cb) = FutureResult::new();
        server
            .receive(
                ReceiveOptions {
                    max_size: 1024 * 1024,
                    ..ReceiveOptions::default()
                },
                receive_cb,
            )
            .unwrap();
        let event = chunk.wait_timeout(DELIVERY).expect("drain stuck");
        assert_eq!(event.kind, EventType::Complete);
        collected.extend_from_slice(&event.context.data);
    }
    assert_eq!(collected, payload);

    let send_event = sent.wait_timeout(DELIVERY).expect("send completion stuck");
    assert_eq!(send_event.kind, EventType::Complete);

    let (eof, eof_cb) = FutureResult::new();
    server.receive(ReceiveOptions::default(), eof_cb).unwrap();
    let event = eof.wait_timeout(DELIVERY).expect("eof stuck");
    assert_eq!(event.context.error, Some(Error::Eof));

    // New sends are refused after the shutdown.
    assert_eq!(
        client.send(b"late".to_vec(), SendOptions::default(), None),
        Err(Error::ConnectionDead)
    );

    client.close(None);
    server.close(None);
    listener.close(None);
    interface.shutdown();
}
