//! Resolver configuration from the platform's standard locations.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use log::debug;

const DNS_PORT: u16 = 53;

/// Resolver behavior knobs, seeded from `/etc/resolv.conf` on Unix-like
/// hosts.
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// Name servers queried in order.
    pub servers: Vec<SocketAddr>,
    /// Search domains appended to unqualified names.
    pub search: Vec<String>,
    /// Query attempts per server before giving up.
    pub attempts: usize,
    /// Base per-attempt timeout; retries back off exponentially from it.
    pub timeout: Duration,
    /// Cache bounds.
    pub cache_max_entries: usize,
    pub cache_max_bytes: usize,
    /// Cap applied on top of record TTLs.
    pub max_ttl: Duration,
    /// Overrides database (hosts-style file).
    pub hosts_path: PathBuf,
    /// Service-name to port table.
    pub services_path: PathBuf,
}

impl Default for ResolverConfig {
    fn default() -> ResolverConfig {
        ResolverConfig {
            servers: Vec::new(),
            search: Vec::new(),
            attempts: 2,
            timeout: Duration::from_secs(5),
            cache_max_entries: 4_096,
            cache_max_bytes: 1024 * 1024,
            max_ttl: Duration::from_secs(3_600),
            hosts_path: PathBuf::from("/etc/hosts"),
            services_path: PathBuf::from("/etc/services"),
        }
    }
}

impl ResolverConfig {
    /// Loads the system configuration, falling back to defaults when the
    /// standard files are absent.
    pub fn system() -> ResolverConfig {
        let mut config = ResolverConfig::default();
        if let Ok(text) = std::fs::read_to_string("/etc/resolv.conf") {
            config.apply_resolv_conf(&text);
        }
        debug!(
            "resolver configured with {} server(s), {} attempt(s)",
            config.servers.len(),
            config.attempts
        );
        config
    }

    /// Parses `resolv.conf(5)` content into this configuration.
    pub fn apply_resolv_conf(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.split(['#', ';']).next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("nameserver") => {
                    if let Some(value) = parts.next() {
                        if let Ok(addr) = value.parse::<IpAddr>() {
                            self.servers.push(SocketAddr::new(addr, DNS_PORT));
                        }
                    }
                }
                Some("search") | Some("domain") => {
                    self.search = parts.map(|s| s.to_ascii_lowercase()).collect();
                }
                Some("options") => {
                    for option in parts {
                        if let Some(value) = option.strip_prefix("attempts:") {
                            if let Ok(attempts) = value.parse::<usize>() {
                                self.attempts = attempts.clamp(1, 5);
                            }
                        } else if let Some(value) = option.strip_prefix("timeout:") {
                            if let Ok(seconds) = value.parse::<u64>() {
                                self.timeout = Duration::from_secs(seconds.clamp(1, 30));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resolv_conf() {
        let mut config = ResolverConfig::default();
        config.apply_resolv_conf(
            "# comment\n\
             nameserver 192.0.2.53\n\
             nameserver 2001:db8::53 ; trailing\n\
             search corp.test example.test\n\
             options attempts:3 timeout:2 ndots:1\n",
        );
        assert_eq!(
            config.servers,
            vec![
                "192.0.2.53:53".parse().unwrap(),
                "[2001:db8::53]:53".parse().unwrap(),
            ]
        );
        assert_eq!(config.search, vec!["corp.test", "example.test"]);
        assert_eq!(config.attempts, 3);
        assert_eq!(config.timeout, Duration::from_secs(2));
    }
}
