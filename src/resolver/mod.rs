//! Name resolution: overrides, cache, and the iterative DNS client.
//!
//! Lookup order is fixed: the override database is authoritative and
//! bypasses everything; the cache answers next; only then does the client
//! go to the network. Network lookups run on the resolver's worker threads
//! and complete through callbacks like every other operation.

mod cache;
mod client;
mod config;
mod message;
mod overrides;

pub use config::ResolverConfig;
pub use message::{
    Message, Question, Record, RecordData, CLASS_IN, TYPE_A, TYPE_AAAA, TYPE_CNAME, TYPE_PTR,
    TYPE_SRV,
};
pub use overrides::Overrides;

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::callback::Callback;
use crate::{Error, Result};

use cache::Cache;
use client::DnsClient;
use message::RecordData as Data;

/// Address family restriction for forward lookups.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IpAddressFamily {
    V4,
    V6,
}

#[derive(Clone, Debug, Default)]
pub struct GetIpAddressOptions {
    pub family: Option<IpAddressFamily>,
    /// Skip the cache (the override database still applies).
    pub bypass_cache: bool,
}

#[derive(Clone, Debug, Default)]
pub struct GetDomainNameOptions {
    pub bypass_cache: bool,
}

/// Protocol qualifier for service/port lookups.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl PortProtocol {
    fn as_str(self) -> &'static str {
        match self {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
        }
    }
}

#[derive(Clone, Debug)]
pub struct GetPortOptions {
    pub protocol: PortProtocol,
}

impl Default for GetPortOptions {
    fn default() -> GetPortOptions {
        GetPortOptions {
            protocol: PortProtocol::Tcp,
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct JobQueue {
    jobs: Mutex<Option<VecDeque<Job>>>,
    available: Condvar,
}

impl JobQueue {
    fn push(&self, job: Job) -> bool {
        let mut jobs = self.jobs.lock();
        match jobs.as_mut() {
            Some(jobs) => {
                jobs.push_back(job);
                self.available.notify_one();
                true
            }
            None => false,
        }
    }

    /// Blocks for the next job; `None` once the queue shut down.
    fn pop(&self) -> Option<Job> {
        let mut jobs = self.jobs.lock();
        loop {
            match jobs.as_mut() {
                Some(queue) => match queue.pop_front() {
                    Some(job) => return Some(job),
                    None => self.available.wait(&mut jobs),
                },
                None => return None,
            }
        }
    }

    fn close(&self) {
        *self.jobs.lock() = None;
        self.available.notify_all();
    }
}

/// The resolver subsystem.
pub struct Resolver {
    config: ResolverConfig,
    overrides: RwLock<Overrides>,
    name_cache: Mutex<Cache<String, Vec<IpAddr>>>,
    addr_cache: Mutex<Cache<IpAddr, Vec<String>>>,
    client: DnsClient,
    queue: Arc<JobQueue>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Resolver {
    /// Builds a resolver over the given configuration, loading the
    /// override and service databases it names.
    pub fn new(config: ResolverConfig) -> Arc<Resolver> {
        let mut overrides = Overrides::new();
        overrides.load_hosts_file(&config.hosts_path);
        overrides.load_services_file(&config.services_path);

        let queue = Arc::new(JobQueue {
            jobs: Mutex::new(Some(VecDeque::new())),
            available: Condvar::new(),
        });

        let resolver = Arc::new(Resolver {
            client: DnsClient::new(&config),
            name_cache: Mutex::new(Cache::new(config.cache_max_entries, config.cache_max_bytes)),
            addr_cache: Mutex::new(Cache::new(config.cache_max_entries, config.cache_max_bytes)),
            overrides: RwLock::new(overrides),
            config,
            queue: Arc::clone(&queue),
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = resolver.workers.lock();
        for index in 0..2 {
            let queue = Arc::clone(&queue);
            workers.push(
                thread::Builder::new()
                    .name(format!("resolver-{}", index))
                    .spawn(move || {
                        while let Some(job) = queue.pop() {
                            job();
                        }
                    })
                    .expect("unable to spawn resolver worker"),
            );
        }
        drop(workers);
        resolver
    }

    /// Builds a resolver from the system configuration.
    pub fn system() -> Arc<Resolver> {
        Resolver::new(ResolverConfig::system())
    }

    /// Adds an authoritative name override.
    pub fn add_override(&self, name: &str, address: IpAddr) {
        self.overrides.write().add_host(name, address);
    }

    /// Adds an authoritative service override.
    pub fn add_service_override(&self, service: &str, protocol: PortProtocol, port: u16) {
        self.overrides
            .write()
            .add_service(service, protocol.as_str(), port);
    }

    /// Resolves `name` to its IP addresses: overrides, then cache, then
    /// the network.
    pub fn get_ip_address(
        self: &Arc<Self>,
        name: &str,
        options: GetIpAddressOptions,
        callback: Callback<Result<Vec<IpAddr>>>,
    ) {
        let name = name.trim_end_matches('.').to_ascii_lowercase();

        // A literal address resolves to itself.
        if let Ok(literal) = name.parse::<IpAddr>() {
            callback.complete_or(Ok(vec![literal]), Err(Error::Cancelled), None, false);
            return;
        }

        if let Some(ips) = self.overrides.read().ip_addresses(&name) {
            trace!("{} answered from overrides", name);
            let ips = filter_family(ips, options.family);
            callback.complete_or(Ok(ips), Err(Error::Cancelled), None, false);
            return;
        }

        if !options.bypass_cache {
            if let Some(ips) = self.name_cache.lock().get(&name, Instant::now()) {
                trace!("{} answered from cache", name);
                let ips = filter_family(ips, options.family);
                callback.complete_or(Ok(ips), Err(Error::Cancelled), None, false);
                return;
            }
        }

        let resolver = Arc::clone(self);
        let submitted = self.queue.push(Box::new(move || {
            let result = resolver.resolve_name(&name, options.family);
            callback.complete_or(result, Err(Error::Cancelled), None, false);
        }));
        if !submitted {
            debug!("resolver shut down; lookups fail with Cancelled");
        }
    }

    /// Reverse-resolves `address` to its domain names.
    pub fn get_domain_name(
        self: &Arc<Self>,
        address: IpAddr,
        options: GetDomainNameOptions,
        callback: Callback<Result<Vec<String>>>,
    ) {
        if let Some(names) = self.overrides.read().domain_names(&address) {
            callback.complete_or(Ok(names), Err(Error::Cancelled), None, false);
            return;
        }
        if !options.bypass_cache {
            if let Some(names) = self.addr_cache.lock().get(&address, Instant::now()) {
                callback.complete_or(Ok(names), Err(Error::Cancelled), None, false);
                return;
            }
        }
        let resolver = Arc::clone(self);
        let _ = self.queue.push(Box::new(move || {
            let result = resolver.resolve_address(address);
            callback.complete_or(result, Err(Error::Cancelled), None, false);
        }));
    }

    /// Maps a service name to its port via overrides and the system
    /// service table.
    pub fn get_port(&self, service: &str, options: GetPortOptions) -> Result<u16> {
        if let Ok(port) = service.parse::<u16>() {
            return Ok(port);
        }
        self.overrides
            .read()
            .port(service, options.protocol.as_str())
            .ok_or(Error::Invalid)
    }

    /// Maps a port back to its service name.
    pub fn get_service_name(&self, port: u16, options: GetPortOptions) -> Result<String> {
        self.overrides
            .read()
            .service_name(port, options.protocol.as_str())
            .ok_or(Error::Invalid)
    }

    /// The host's non-loopback interface addresses.
    pub fn get_local_ip_address(&self) -> Result<Vec<IpAddr>> {
        crate::sys::net::local_ip_addresses().map_err(Error::from)
    }

    /// The host's own name.
    pub fn get_hostname(&self) -> Result<String> {
        crate::sys::net::hostname().map_err(Error::from)
    }

    /// Stops the worker threads; in-flight lookups finish first.
    pub fn shutdown(&self) {
        self.queue.close();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }

    /// Blocking forward lookup on a worker thread.
    fn resolve_name(&self, name: &str, family: Option<IpAddressFamily>) -> Result<Vec<IpAddr>> {
        let mut candidates = Vec::new();
        if !name.contains('.') {
            for domain in &self.config.search {
                candidates.push(format!("{}.{}", name, domain));
            }
        }
        candidates.push(name.to_string());

        let mut last_error = Error::Unreachable;
        for candidate in candidates {
            match self.resolve_candidate(&candidate, family) {
                Ok((ips, ttl)) if !ips.is_empty() => {
                    let bytes = candidate.len() + ips.len() * std::mem::size_of::<IpAddr>();
                    self.name_cache.lock().put(
                        name.to_string(),
                        ips.clone(),
                        ttl,
                        bytes,
                        Instant::now(),
                    );
                    return Ok(filter_family(ips, family));
                }
                Ok(_) => last_error = Error::Unreachable,
                Err(error) => last_error = error,
            }
        }
        Err(last_error)
    }

    fn resolve_candidate(
        &self,
        name: &str,
        family: Option<IpAddressFamily>,
    ) -> Result<(Vec<IpAddr>, Duration)> {
        let mut ips = Vec::new();
        let mut min_ttl = self.config.max_ttl;
        let types: &[u16] = match family {
            Some(IpAddressFamily::V4) => &[TYPE_A],
            Some(IpAddressFamily::V6) => &[TYPE_AAAA],
            None => &[TYPE_A, TYPE_AAAA],
        };
        let mut last_error = None;
        for qtype in types {
            match self.client.query(name, *qtype) {
                Ok(response) => {
                    if response.rcode != 0 {
                        last_error = Some(Error::Unreachable);
                        continue;
                    }
                    for answer in &response.answers {
                        // CNAME chains are flattened by the server; accept
                        // address records for any owner in the answer.
                        match answer.data {
                            Data::A(addr) => ips.push(IpAddr::V4(addr)),
                            Data::Aaaa(addr) => ips.push(IpAddr::V6(addr)),
                            _ => continue,
                        }
                        let ttl = Duration::from_secs(u64::from(answer.ttl.max(1)));
                        min_ttl = min_ttl.min(ttl);
                    }
                }
                Err(error) => last_error = Some(error),
            }
        }
        if ips.is_empty() {
            if let Some(error) = last_error {
                return Err(error);
            }
        }
        Ok((ips, min_ttl))
    }

    /// Blocking reverse lookup on a worker thread.
    fn resolve_address(&self, address: IpAddr) -> Result<Vec<String>> {
        let reverse = reverse_name(&address);
        let response = self.client.query(&reverse, TYPE_PTR)?;
        if response.rcode != 0 {
            return Err(Error::Unreachable);
        }
        let mut names = Vec::new();
        let mut min_ttl = self.config.max_ttl;
        for answer in &response.answers {
            if let Data::Ptr(name) = &answer.data {
                names.push(name.clone());
                min_ttl = min_ttl.min(Duration::from_secs(u64::from(answer.ttl.max(1))));
            }
        }
        if names.is_empty() {
            return Err(Error::Unreachable);
        }
        let bytes = names.iter().map(String::len).sum::<usize>() + 16;
        self.addr_cache
            .lock()
            .put(address, names.clone(), min_ttl, bytes, Instant::now());
        Ok(names)
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        // No join here: the last reference may be a job running on a
        // worker thread, and a worker cannot join itself. Workers exit on
        // their own once the queue closes.
        self.queue.close();
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Resolver")
            .field("servers", &self.config.servers.len())
            .field("cached_names", &self.name_cache.lock().len())
            .finish()
    }
}

fn filter_family(ips: Vec<IpAddr>, family: Option<IpAddressFamily>) -> Vec<IpAddr> {
    match family {
        None => ips,
        Some(IpAddressFamily::V4) => ips.into_iter().filter(IpAddr::is_ipv4).collect(),
        Some(IpAddressFamily::V6) => ips.into_iter().filter(IpAddr::is_ipv6).collect(),
    }
}

/// The PTR owner name for an address.
fn reverse_name(address: &IpAddr) -> String {
    match address {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!(
                "{}.{}.{}.{}.in-addr.arpa",
                octets[3], octets[2], octets[1], octets[0]
            )
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(72);
            for byte in v6.octets().iter().rev() {
                name.push(char::from_digit(u32::from(byte & 0x0f), 16).unwrap());
                name.push('.');
                name.push(char::from_digit(u32::from(byte >> 4), 16).unwrap());
                name.push('.');
            }
            name.push_str("ip6.arpa");
            name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn reverse_names() {
        assert_eq!(
            reverse_name(&"192.0.2.5".parse().unwrap()),
            "5.2.0.192.in-addr.arpa"
        );
        let v6 = reverse_name(&"2001:db8::1".parse().unwrap());
        assert!(v6.ends_with("ip6.arpa"));
        assert!(v6.starts_with("1.0.0.0."));
    }

    #[test]
    fn override_is_authoritative() {
        let resolver = Resolver::new(ResolverConfig {
            hosts_path: "/nonexistent".into(),
            services_path: "/nonexistent".into(),
            ..ResolverConfig::default()
        });
        resolver.add_override("example.test", IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));

        let (future, callback) = crate::FutureResult::new();
        resolver.get_ip_address("Example.Test.", GetIpAddressOptions::default(), callback);
        assert_eq!(
            future.wait(),
            Ok(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))])
        );
        resolver.shutdown();
    }

    #[test]
    fn literal_addresses_short_circuit() {
        let resolver = Resolver::new(ResolverConfig {
            hosts_path: "/nonexistent".into(),
            services_path: "/nonexistent".into(),
            ..ResolverConfig::default()
        });
        let (future, callback) = crate::FutureResult::new();
        resolver.get_ip_address("127.0.0.1", GetIpAddressOptions::default(), callback);
        assert_eq!(
            future.wait(),
            Ok(vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))])
        );
    }

    #[test]
    fn service_ports_from_overrides() {
        let resolver = Resolver::new(ResolverConfig {
            hosts_path: "/nonexistent".into(),
            services_path: "/nonexistent".into(),
            ..ResolverConfig::default()
        });
        resolver.add_service_override("echo-control", PortProtocol::Tcp, 4_711);
        assert_eq!(
            resolver.get_port("echo-control", GetPortOptions::default()),
            Ok(4_711)
        );
        assert_eq!(
            resolver.get_service_name(4_711, GetPortOptions::default()),
            Ok("echo-control".to_string())
        );
        assert_eq!(resolver.get_port("8080", GetPortOptions::default()), Ok(8080));
        assert!(resolver
            .get_port("no-such-service", GetPortOptions::default())
            .is_err());
    }
}
