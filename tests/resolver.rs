use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use netio::resolver::{
    GetDomainNameOptions, GetIpAddressOptions, IpAddressFamily, Message, Record, RecordData,
    ResolverConfig, CLASS_IN, TYPE_A, TYPE_PTR,
};
use netio::{FutureResult, Resolver};

mod util;

use util::{init, DELIVERY};

/// A canned-answer DNS server on loopback UDP. Returns its address and a
/// counter of queries served.
fn spawn_udp_server(
    answer: impl Fn(&Message) -> Message + Send + 'static,
) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let address = socket.local_addr().unwrap();
    let served = Arc::new(AtomicUsize::new(0));
    let served2 = Arc::clone(&served);
    thread::spawn(move || {
        let mut buf = [0u8; 1_024];
        while let Ok((n, from)) = socket.recv_from(&mut buf) {
            let query = match Message::decode(&buf[..n]) {
                Ok(query) => query,
                Err(_) => continue,
            };
            served2.fetch_add(1, Ordering::SeqCst);
            let response = answer(&query);
            let wire = response.encode().unwrap();
            let _ = socket.send_to(&wire, from);
        }
    });
    (address, served)
}

fn a_answer(query: &Message, address: Ipv4Addr, ttl: u32) -> Message {
    let mut response = query.clone();
    response.response = true;
    if let Some(question) = query.questions.first() {
        if question.qtype == TYPE_A {
            response.answers.push(Record {
                name: question.name.clone(),
                rtype: TYPE_A,
                class: CLASS_IN,
                ttl,
                data: RecordData::A(address),
            });
        }
    }
    response
}

fn test_config(server: SocketAddr) -> ResolverConfig {
    ResolverConfig {
        servers: vec![server],
        attempts: 1,
        timeout: Duration::from_secs(2),
        hosts_path: "/nonexistent".into(),
        services_path: "/nonexistent".into(),
        ..ResolverConfig::default()
    }
}

fn lookup(resolver: &Arc<Resolver>, name: &str) -> netio::Result<Vec<IpAddr>> {
    let (future, callback) = FutureResult::new();
    resolver.get_ip_address(
        name,
        GetIpAddressOptions {
            family: Some(IpAddressFamily::V4),
            ..GetIpAddressOptions::default()
        },
        callback,
    );
    future.wait_timeout(DELIVERY).expect("lookup stalled")
}

#[test]
fn network_lookup_and_cache_hit() {
    init();
    let (server, served) = spawn_udp_server(|query| {
        a_answer(query, Ipv4Addr::new(192, 0, 2, 55), 300)
    });
    let resolver = Resolver::new(test_config(server));

    let first = lookup(&resolver, "cached.test").expect("first lookup failed");
    assert_eq!(first, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 55))]);
    assert_eq!(served.load(Ordering::SeqCst), 1);

    // The second call is served from the cache: no further query, and far
    // faster than a network round trip.
    let before = Instant::now();
    let second = lookup(&resolver, "cached.test").expect("second lookup failed");
    assert_eq!(second, first);
    assert!(before.elapsed() < Duration::from_millis(100));
    assert_eq!(served.load(Ordering::SeqCst), 1);

    resolver.shutdown();
}

/// An overridden name resolves to the override regardless of what the
/// cache or the network would say.
#[test]
fn override_beats_cache_and_network() {
    init();
    let (server, served) = spawn_udp_server(|query| {
        a_answer(query, Ipv4Addr::new(203, 0, 113, 99), 300)
    });
    let resolver = Resolver::new(test_config(server));

    // Warm the cache with the network answer.
    let network = lookup(&resolver, "example.test").expect("network lookup failed");
    assert_eq!(network, vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 99))]);

    // The override now takes precedence over the cached entry.
    resolver.add_override("example.test", IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
    let overridden = lookup(&resolver, "example.test").expect("override lookup failed");
    assert_eq!(overridden, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))]);
    // And no extra network traffic happened for it.
    assert_eq!(served.load(Ordering::SeqCst), 1);

    resolver.shutdown();
}

#[test]
fn expired_entries_go_back_to_the_network() {
    init();
    let (server, served) = spawn_udp_server(|query| {
        // TTL of one second.
        a_answer(query, Ipv4Addr::new(192, 0, 2, 9), 1)
    });
    let resolver = Resolver::new(test_config(server));

    lookup(&resolver, "shortlived.test").expect("first lookup failed");
    assert_eq!(served.load(Ordering::SeqCst), 1);

    thread::sleep(Duration::from_millis(1_200));
    lookup(&resolver, "shortlived.test").expect("relookup failed");
    assert_eq!(served.load(Ordering::SeqCst), 2);

    resolver.shutdown();
}

/// A truncated UDP answer falls back to TCP on the same server.
#[test]
fn truncated_udp_falls_back_to_tcp() {
    init();
    // TCP side first so both protocols share the port.
    let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = tcp.local_addr().unwrap();
    let udp = UdpSocket::bind(address).unwrap();

    thread::spawn(move || {
        let mut buf = [0u8; 1_024];
        while let Ok((n, from)) = udp.recv_from(&mut buf) {
            if let Ok(query) = Message::decode(&buf[..n]) {
                let mut response = query.clone();
                response.response = true;
                response.truncated = true;
                let _ = udp.send_to(&response.encode().unwrap(), from);
            }
        }
    });
    thread::spawn(move || {
        for stream in tcp.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => continue,
            };
            let mut length = [0u8; 2];
            if stream.read_exact(&mut length).is_err() {
                continue;
            }
            let mut body = vec![0u8; u16::from_be_bytes(length) as usize];
            if stream.read_exact(&mut body).is_err() {
                continue;
            }
            let query = match Message::decode(&body) {
                Ok(query) => query,
                Err(_) => continue,
            };
            let response = a_answer(&query, Ipv4Addr::new(192, 0, 2, 77), 60);
            let wire = response.encode().unwrap();
            let mut framed = Vec::with_capacity(wire.len() + 2);
            framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
            framed.extend_from_slice(&wire);
            let _ = stream.write_all(&framed);
        }
    });

    let resolver = Resolver::new(test_config(address));
    let answer = lookup(&resolver, "truncated.test").expect("tcp fallback failed");
    assert_eq!(answer, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 77))]);
    resolver.shutdown();
}

#[test]
fn reverse_lookup_via_ptr() {
    init();
    let (server, _served) = spawn_udp_server(|query| {
        let mut response = query.clone();
        response.response = true;
        if let Some(question) = query.questions.first() {
            if question.qtype == TYPE_PTR {
                response.answers.push(Record {
                    name: question.name.clone(),
                    rtype: TYPE_PTR,
                    class: CLASS_IN,
                    ttl: 60,
                    data: RecordData::Ptr("host.example.test".into()),
                });
            }
        }
        response
    });
    let resolver = Resolver::new(test_config(server));

    let (future, callback) = FutureResult::new();
    resolver.get_domain_name(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
        GetDomainNameOptions::default(),
        callback,
    );
    let names = future
        .wait_timeout(DELIVERY)
        .expect("reverse lookup stalled")
        .expect("reverse lookup failed");
    assert_eq!(names, vec!["host.example.test"]);

    resolver.shutdown();
}

#[test]
fn host_introspection() {
    init();
    let resolver = Resolver::new(ResolverConfig {
        hosts_path: "/nonexistent".into(),
        services_path: "/nonexistent".into(),
        ..ResolverConfig::default()
    });
    let hostname = resolver.get_hostname().expect("no hostname");
    assert!(!hostname.is_empty());
    // The address list may legitimately be empty in a minimal namespace;
    // the call itself must succeed.
    resolver.get_local_ip_address().expect("getifaddrs failed");
    resolver.shutdown();
}
