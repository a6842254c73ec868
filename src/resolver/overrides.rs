//! The authoritative override database.
//!
//! Overridden answers bypass both the cache and the network: a name present
//! here resolves to its override regardless of any cached or remote state.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use log::debug;

/// Host, address, and service overrides, loadable from hosts-style and
/// services-style files.
#[derive(Debug, Default)]
pub struct Overrides {
    ips_by_name: HashMap<String, Vec<IpAddr>>,
    names_by_ip: HashMap<IpAddr, Vec<String>>,
    // Keyed by (service, protocol), e.g. ("domain", "udp").
    port_by_service: HashMap<(String, String), u16>,
    service_by_port: HashMap<(u16, String), String>,
}

impl Overrides {
    pub fn new() -> Overrides {
        Overrides::default()
    }

    pub fn add_host(&mut self, name: &str, address: IpAddr) {
        let name = name.to_ascii_lowercase();
        let ips = self.ips_by_name.entry(name.clone()).or_default();
        if !ips.contains(&address) {
            ips.push(address);
        }
        let names = self.names_by_ip.entry(address).or_default();
        if !names.contains(&name) {
            names.push(name);
        }
    }

    pub fn add_service(&mut self, service: &str, protocol: &str, port: u16) {
        let service = service.to_ascii_lowercase();
        let protocol = protocol.to_ascii_lowercase();
        self.port_by_service
            .insert((service.clone(), protocol.clone()), port);
        self.service_by_port.entry((port, protocol)).or_insert(service);
    }

    pub fn ip_addresses(&self, name: &str) -> Option<Vec<IpAddr>> {
        self.ips_by_name.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn domain_names(&self, address: &IpAddr) -> Option<Vec<String>> {
        self.names_by_ip.get(address).cloned()
    }

    pub fn port(&self, service: &str, protocol: &str) -> Option<u16> {
        self.port_by_service
            .get(&(
                service.to_ascii_lowercase(),
                protocol.to_ascii_lowercase(),
            ))
            .copied()
    }

    pub fn service_name(&self, port: u16, protocol: &str) -> Option<String> {
        self.service_by_port
            .get(&(port, protocol.to_ascii_lowercase()))
            .cloned()
    }

    /// Loads a `hosts(5)`-style file; missing files are not an error.
    pub fn load_hosts_file<P: AsRef<Path>>(&mut self, path: P) {
        if let Ok(text) = std::fs::read_to_string(path.as_ref()) {
            self.load_hosts(&text);
            debug!(
                "loaded host overrides from {} ({} names)",
                path.as_ref().display(),
                self.ips_by_name.len()
            );
        }
    }

    pub fn load_hosts(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let address = match parts.next().and_then(|a| a.parse::<IpAddr>().ok()) {
                Some(address) => address,
                None => continue,
            };
            for name in parts {
                self.add_host(name, address);
            }
        }
    }

    /// Loads a `services(5)`-style file; missing files are not an error.
    pub fn load_services_file<P: AsRef<Path>>(&mut self, path: P) {
        if let Ok(text) = std::fs::read_to_string(path.as_ref()) {
            self.load_services(&text);
        }
    }

    pub fn load_services(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let service = match parts.next() {
                Some(service) => service,
                None => continue,
            };
            let Some((port, protocol)) = parts.next().and_then(|value| {
                let (port, protocol) = value.split_once('/')?;
                Some((port.parse::<u16>().ok()?, protocol))
            }) else {
                continue;
            };
            self.add_service(service, protocol, port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn hosts_round_trip() {
        let mut overrides = Overrides::new();
        overrides.load_hosts(
            "# local names\n\
             192.0.2.1   example.test www.example.test\n\
             ::1         localhost6\n\
             bogus-line\n",
        );
        assert_eq!(
            overrides.ip_addresses("EXAMPLE.test"),
            Some(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))])
        );
        let names = overrides
            .domain_names(&IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
            .unwrap();
        assert_eq!(names, vec!["example.test", "www.example.test"]);
        assert_eq!(overrides.ip_addresses("missing.test"), None);
    }

    #[test]
    fn services_lookup_both_ways() {
        let mut overrides = Overrides::new();
        overrides.load_services(
            "domain 53/udp\n\
             domain 53/tcp\n\
             http 80/tcp www # alias\n",
        );
        assert_eq!(overrides.port("domain", "udp"), Some(53));
        assert_eq!(overrides.port("http", "tcp"), Some(80));
        assert_eq!(overrides.service_name(80, "tcp"), Some("http".into()));
        assert_eq!(overrides.service_name(81, "tcp"), None);
    }
}
