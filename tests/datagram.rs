use std::time::{Duration, Instant};

use netio::socket::event::EventType;
use netio::socket::options::{ReceiveOptions, SendOptions};
use netio::{Endpoint, Error, FutureResult, Interface, InterfaceConfig, Transport};

mod util;

use util::{init, DELIVERY};

#[test]
fn datagrams_keep_their_boundaries() {
    init();
    let interface = Interface::new(InterfaceConfig::default()).unwrap();

    let receiver = interface.create_datagram_socket(Default::default());
    receiver
        .bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap())
        .unwrap();
    let address = receiver.local_endpoint().unwrap();

    let sender = interface.create_datagram_socket(Default::default());
    sender
        .bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap())
        .unwrap();
    let sender_address = sender.local_endpoint().unwrap();

    // Two sends, two receives: boundaries are preserved, never coalesced.
    for payload in [&b"first"[..], &b"second!"[..]] {
        let (sent, send_cb) = FutureResult::new();
        sender
            .send(
                payload.to_vec(),
                Some(address.clone()),
                SendOptions::default(),
                Some(send_cb),
            )
            .unwrap();
        let event = sent.wait_timeout(DELIVERY).expect("send stuck");
        assert_eq!(event.kind, EventType::Complete);
        assert_eq!(event.context.bytes_sent, payload.len());
    }

    for expected in [&b"first"[..], &b"second!"[..]] {
        let (received, receive_cb) = FutureResult::new();
        receiver
            .receive(ReceiveOptions::default(), receive_cb)
            .unwrap();
        let event = received.wait_timeout(DELIVERY).expect("receive stuck");
        assert_eq!(event.kind, EventType::Complete);
        assert_eq!(event.context.data, expected);
        // The source endpoint and a software timestamp ride along.
        assert_eq!(event.context.endpoint.as_ref(), Some(&sender_address));
        assert!(event.context.timestamp.is_some());
    }

    sender.close(None);
    receiver.close(None);
    interface.shutdown();
}

#[test]
fn connected_datagram_socket_sends_without_endpoint() {
    init();
    let interface = Interface::new(InterfaceConfig::default()).unwrap();

    let receiver = interface.create_datagram_socket(Default::default());
    receiver
        .bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap())
        .unwrap();
    let address = receiver.local_endpoint().unwrap();

    let sender = interface.create_datagram_socket(Default::default());
    sender.open(Transport::UdpIpv4).unwrap();
    sender.connect(address).unwrap();

    // No endpoint given: the connected peer is implied.
    assert_eq!(
        sender.send(b"x".to_vec(), None, SendOptions::default(), None),
        Ok(())
    );
    // An unconnected socket without an endpoint is refused.
    let stray = interface.create_datagram_socket(Default::default());
    stray.open(Transport::UdpIpv4).unwrap();
    assert_eq!(
        stray.send(b"x".to_vec(), None, SendOptions::default(), None),
        Err(Error::Invalid)
    );

    let (received, receive_cb) = FutureResult::new();
    receiver
        .receive(ReceiveOptions::default(), receive_cb)
        .unwrap();
    let event = received.wait_timeout(DELIVERY).expect("receive stuck");
    assert_eq!(event.context.data, b"x");

    stray.close(None);
    sender.close(None);
    receiver.close(None);
    interface.shutdown();
}

#[test]
fn receive_deadline_and_cancellation() {
    init();
    let interface = Interface::new(InterfaceConfig::default()).unwrap();

    let socket = interface.create_datagram_socket(Default::default());
    socket
        .bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap())
        .unwrap();

    // Deadline path.
    let (expired, expired_cb) = FutureResult::new();
    socket
        .receive(
            ReceiveOptions {
                deadline: Some(Instant::now() + Duration::from_millis(30)),
                ..ReceiveOptions::default()
            },
            expired_cb,
        )
        .unwrap();
    let event = expired.wait_timeout(DELIVERY).expect("deadline stuck");
    assert_eq!(event.kind, EventType::Deadline);
    assert_eq!(event.context.error, Some(Error::WouldBlockReceive));

    // Cancellation path.
    let (cancelled, cancelled_cb) = FutureResult::new();
    let token = cancelled_cb.cancellation();
    socket
        .receive(ReceiveOptions::default(), cancelled_cb)
        .unwrap();
    assert!(token.abort());
    let event = cancelled.wait_timeout(DELIVERY).expect("cancel stuck");
    assert_eq!(event.kind, EventType::Canceled);
    assert_eq!(event.context.error, Some(Error::Cancelled));

    socket.close(None);
    interface.shutdown();
}
