use netio::socket::event::EventType;
use netio::socket::options::{AcceptOptions, ConnectOptions, ReceiveOptions, SendOptions};
use netio::tls::EncryptionRole;
use netio::{Endpoint, FutureResult, Interface, InterfaceConfig};

mod util;

use util::{init, FakeEncryptionSession, DELIVERY};

/// Upgrade both ends of a connection, exchange application data through the
/// sessions, then downgrade and finish in the clear.
#[test]
fn upgrade_exchange_downgrade() {
    init();
    let interface = Interface::new(InterfaceConfig {
        thread_count: 2,
        ..InterfaceConfig::default()
    })
    .unwrap();

    let listener = interface.create_listener_socket(Default::default());
    listener
        .bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap())
        .unwrap();
    listener.listen(8).unwrap();

    let (accepted, accept_cb) = FutureResult::new();
    listener.accept(AcceptOptions::default(), accept_cb).unwrap();

    let client = interface.create_stream_socket(Default::default());
    let (connected, connect_cb) = FutureResult::new();
    client
        .connect(
            listener.local_endpoint().unwrap(),
            ConnectOptions::default(),
            connect_cb,
        )
        .unwrap();
    connected.wait_timeout(DELIVERY).expect("connect stuck");
    let server = accepted
        .wait_timeout(DELIVERY)
        .expect("accept stuck")
        .socket
        .unwrap();

    // The server installs its session first so the client's handshake
    // records are routed into it, not the raw receive queue.
    let (server_upgraded, server_upgrade_cb) = FutureResult::new();
    server
        .upgrade(
            FakeEncryptionSession::new(),
            EncryptionRole::Server,
            server_upgrade_cb,
        )
        .unwrap();

    let (client_upgraded, client_upgrade_cb) = FutureResult::new();
    client
        .upgrade(
            FakeEncryptionSession::new(),
            EncryptionRole::Client,
            client_upgrade_cb,
        )
        .unwrap();

    assert_eq!(
        client_upgraded.wait_timeout(DELIVERY).expect("client upgrade stuck").kind,
        EventType::Complete
    );
    assert_eq!(
        server_upgraded.wait_timeout(DELIVERY).expect("server upgrade stuck").kind,
        EventType::Complete
    );

    // Plaintext in, ciphertext on the wire, plaintext out.
    let (got, receive_cb) = FutureResult::new();
    server
        .receive(
            ReceiveOptions {
                min_size: 6,
                ..ReceiveOptions::default()
            },
            receive_cb,
        )
        .unwrap();
    client
        .send(b"secret".to_vec(), SendOptions::default(), None)
        .unwrap();
    let event = got.wait_timeout(DELIVERY).expect("encrypted receive stuck");
    assert_eq!(event.kind, EventType::Complete);
    assert_eq!(event.context.data, b"secret");

    // Downgrade both directions; each side's close-notify completes the
    // other's receive-side downgrade.
    let (client_downgraded, client_downgrade_cb) = FutureResult::new();
    client.downgrade(client_downgrade_cb).unwrap();
    let (server_downgraded, server_downgrade_cb) = FutureResult::new();
    server.downgrade(server_downgrade_cb).unwrap();

    let client_event = client_downgraded
        .wait_timeout(DELIVERY)
        .expect("client downgrade stuck");
    assert_eq!(client_event.kind, EventType::Complete);
    assert!(client_event.context.send);
    assert!(client_event.context.receive);

    let server_event = server_downgraded
        .wait_timeout(DELIVERY)
        .expect("server downgrade stuck");
    assert_eq!(server_event.kind, EventType::Complete);

    // Back in the clear.
    let (plain, plain_cb) = FutureResult::new();
    server
        .receive(
            ReceiveOptions {
                min_size: 5,
                ..ReceiveOptions::default()
            },
            plain_cb,
        )
        .unwrap();
    client
        .send(b"clear".to_vec(), SendOptions::default(), None)
        .unwrap();
    let event = plain.wait_timeout(DELIVERY).expect("clear receive stuck");
    assert_eq!(event.context.data, b"clear");

    client.close(None);
    server.close(None);
    listener.close(None);
    interface.shutdown();
}

/// Sends submitted while the handshake is in flight wait behind it and go
/// out encrypted once the session establishes.
#[test]
fn pending_sends_queue_behind_the_handshake() {
    init();
    let interface = Interface::new(InterfaceConfig {
        thread_count: 2,
        ..InterfaceConfig::default()
    })
    .unwrap();

    let listener = interface.create_listener_socket(Default::default());
    listener
        .bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap())
        .unwrap();
    listener.listen(8).unwrap();

    let (accepted, accept_cb) = FutureResult::new();
    listener.accept(AcceptOptions::default(), accept_cb).unwrap();

    let client = interface.create_stream_socket(Default::default());
    let (connected, connect_cb) = FutureResult::new();
    client
        .connect(
            listener.local_endpoint().unwrap(),
            ConnectOptions::default(),
            connect_cb,
        )
        .unwrap();
    connected.wait_timeout(DELIVERY).expect("connect stuck");
    let server = accepted
        .wait_timeout(DELIVERY)
        .expect("accept stuck")
        .socket
        .unwrap();

    let (server_upgraded, server_upgrade_cb) = FutureResult::new();
    server
        .upgrade(
            FakeEncryptionSession::new(),
            EncryptionRole::Server,
            server_upgrade_cb,
        )
        .unwrap();

    let (client_upgraded, client_upgrade_cb) = FutureResult::new();
    client
        .upgrade(
            FakeEncryptionSession::new(),
            EncryptionRole::Client,
            client_upgrade_cb,
        )
        .unwrap();

    // Submitted before the handshake completes.
    let (early_sent, early_cb) = FutureResult::new();
    client
        .send(b"early".to_vec(), SendOptions::default(), Some(early_cb))
        .unwrap();

    client_upgraded.wait_timeout(DELIVERY).expect("upgrade stuck");
    server_upgraded.wait_timeout(DELIVERY).expect("upgrade stuck");

    let (got, receive_cb) = FutureResult::new();
    server
        .receive(
            ReceiveOptions {
                min_size: 5,
                ..ReceiveOptions::default()
            },
            receive_cb,
        )
        .unwrap();
    let event = got.wait_timeout(DELIVERY).expect("receive stuck");
    assert_eq!(event.context.data, b"early");
    assert_eq!(
        early_sent.wait_timeout(DELIVERY).expect("send stuck").kind,
        EventType::Complete
    );

    client.close(None);
    server.close(None);
    listener.close(None);
    interface.shutdown();
}
