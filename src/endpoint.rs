//! Endpoints and transports.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{Error, Result};

/// The address of one end of a connection.
///
/// A tagged variant over `(ip-v4, port)`, `(ip-v6, port, scope)` and a local
/// filesystem name. Endpoints compare by value. The canonical text form
/// brackets an IPv6 address when combined with a port, e.g. `[::1]:80`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// An IPv4 address and port.
    V4(SocketAddrV4),
    /// An IPv6 address, port, and scope id.
    V6(SocketAddrV6),
    /// A local (Unix domain) socket path.
    Local(PathBuf),
}

impl Endpoint {
    /// Builds an IP endpoint from an address and port.
    pub fn ip(addr: IpAddr, port: u16) -> Endpoint {
        match addr {
            IpAddr::V4(v4) => Endpoint::V4(SocketAddrV4::new(v4, port)),
            IpAddr::V6(v6) => Endpoint::V6(SocketAddrV6::new(v6, port, 0, 0)),
        }
    }

    /// Builds a local endpoint from a filesystem path.
    pub fn local<P: AsRef<Path>>(path: P) -> Endpoint {
        Endpoint::Local(path.as_ref().to_path_buf())
    }

    /// The IP address, if this is an IP endpoint.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        match self {
            Endpoint::V4(addr) => Some(IpAddr::V4(*addr.ip())),
            Endpoint::V6(addr) => Some(IpAddr::V6(*addr.ip())),
            Endpoint::Local(_) => None,
        }
    }

    /// The port, if this is an IP endpoint.
    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::V4(addr) => Some(addr.port()),
            Endpoint::V6(addr) => Some(addr.port()),
            Endpoint::Local(_) => None,
        }
    }

    /// The filesystem path, if this is a local endpoint.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Endpoint::Local(path) => Some(path),
            _ => None,
        }
    }

    pub fn is_ip(&self) -> bool {
        !matches!(self, Endpoint::Local(_))
    }

    /// The transport carrying stream traffic over this endpoint family.
    pub fn stream_transport(&self) -> Transport {
        match self {
            Endpoint::V4(_) => Transport::TcpIpv4,
            Endpoint::V6(_) => Transport::TcpIpv6,
            Endpoint::Local(_) => Transport::LocalStream,
        }
    }

    /// The transport carrying datagram traffic over this endpoint family.
    pub fn datagram_transport(&self) -> Transport {
        match self {
            Endpoint::V4(_) => Transport::UdpIpv4,
            Endpoint::V6(_) => Transport::UdpIpv6,
            Endpoint::Local(_) => Transport::LocalDatagram,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // SocketAddrV6's Display already brackets the address.
            Endpoint::V4(addr) => addr.fmt(fmt),
            Endpoint::V6(addr) => addr.fmt(fmt),
            Endpoint::Local(path) => path.display().fmt(fmt),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        match addr {
            SocketAddr::V4(v4) => Endpoint::V4(v4),
            SocketAddr::V6(v6) => Endpoint::V6(v6),
        }
    }
}


impl FromStr for Endpoint {
    type Err = Error;

    /// Parses the canonical IP syntax; anything that does not parse as an IP
    /// endpoint is rejected (local endpoints are built from paths, not
    /// parsed).
    fn from_str(s: &str) -> Result<Endpoint> {
        s.parse::<SocketAddr>()
            .map(Endpoint::from)
            .map_err(|_| Error::AddressMalformed)
    }
}

/// The transport protocols a socket can be opened over.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    TcpIpv4,
    TcpIpv6,
    UdpIpv4,
    UdpIpv6,
    LocalStream,
    LocalDatagram,
}

impl Transport {
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            Transport::TcpIpv4 | Transport::TcpIpv6 | Transport::LocalStream
        )
    }

    pub fn is_datagram(self) -> bool {
        !self.is_stream()
    }

    pub fn is_local(self) -> bool {
        matches!(self, Transport::LocalStream | Transport::LocalDatagram)
    }

    /// The "any" endpoint for the transport's family, used as a bind default.
    pub fn any_endpoint(self) -> Endpoint {
        match self {
            Transport::TcpIpv4 | Transport::UdpIpv4 => {
                Endpoint::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            }
            Transport::TcpIpv6 | Transport::UdpIpv6 => {
                Endpoint::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0))
            }
            Transport::LocalStream | Transport::LocalDatagram => Endpoint::Local(PathBuf::new()),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::TcpIpv4 => "tcp/ipv4",
            Transport::TcpIpv6 => "tcp/ipv6",
            Transport::UdpIpv4 => "udp/ipv4",
            Transport::UdpIpv6 => "udp/ipv6",
            Transport::LocalStream => "local/stream",
            Transport::LocalDatagram => "local/datagram",
        };
        name.fmt(fmt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_format() {
        let v4: Endpoint = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(v4.to_string(), "127.0.0.1:8080");

        let v6: Endpoint = "[::1]:80".parse().unwrap();
        assert_eq!(v6.to_string(), "[::1]:80");

        assert!("not-an-endpoint".parse::<Endpoint>().is_err());
    }

    #[test]
    fn value_equality() {
        let a: Endpoint = "10.0.0.1:53".parse().unwrap();
        let b = Endpoint::ip("10.0.0.1".parse().unwrap(), 53);
        assert_eq!(a, b);
        assert_ne!(a, Endpoint::local("/tmp/sock"));
    }

    #[test]
    fn transport_families() {
        let v6: Endpoint = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(v6.stream_transport(), Transport::TcpIpv6);
        assert_eq!(v6.datagram_transport(), Transport::UdpIpv6);
        assert!(Transport::LocalStream.is_local());
        assert!(Transport::UdpIpv4.is_datagram());
    }
}
