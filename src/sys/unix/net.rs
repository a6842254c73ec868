use std::io::{self, IoSlice, IoSliceMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::endpoint::{Endpoint, Transport};

/// The host's own name.
pub(crate) fn hostname() -> io::Result<String> {
    let mut buf = [0u8; 256];
    syscall!(gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()))?;
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Non-loopback addresses of the host's interfaces.
pub(crate) fn local_ip_addresses() -> io::Result<Vec<IpAddr>> {
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    syscall!(getifaddrs(&mut ifap))?;
    let mut addrs = Vec::new();
    let mut cursor = ifap;
    while !cursor.is_null() {
        // SAFETY: the list returned by `getifaddrs(3)` stays valid until
        // `freeifaddrs`.
        unsafe {
            let ifa = &*cursor;
            if !ifa.ifa_addr.is_null() {
                match (*ifa.ifa_addr).sa_family as libc::c_int {
                    libc::AF_INET => {
                        let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                        let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                        if !ip.is_loopback() {
                            addrs.push(IpAddr::V4(ip));
                        }
                    }
                    libc::AF_INET6 => {
                        let sin6 = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                        let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                        if !ip.is_loopback() {
                            addrs.push(IpAddr::V6(ip));
                        }
                    }
                    _ => {}
                }
            }
            cursor = ifa.ifa_next;
        }
    }
    // SAFETY: `ifap` came from `getifaddrs` and is freed exactly once.
    unsafe { libc::freeifaddrs(ifap) };
    Ok(addrs)
}

/// Creates a non-blocking, close-on-exec socket for the transport.
pub(crate) fn open(transport: Transport) -> io::Result<Socket> {
    let domain = match transport {
        Transport::TcpIpv4 | Transport::UdpIpv4 => Domain::IPV4,
        Transport::TcpIpv6 | Transport::UdpIpv6 => Domain::IPV6,
        Transport::LocalStream | Transport::LocalDatagram => Domain::UNIX,
    };
    let ty = if transport.is_stream() {
        Type::STREAM
    } else {
        Type::DGRAM
    };
    // Use `SOCK_NONBLOCK` on platforms that support it.
    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    let ty = ty.nonblocking();
    let protocol = match transport {
        Transport::TcpIpv4 | Transport::TcpIpv6 => Some(Protocol::TCP),
        Transport::UdpIpv4 | Transport::UdpIpv6 => Some(Protocol::UDP),
        Transport::LocalStream | Transport::LocalDatagram => None,
    };
    let socket = Socket::new(domain, ty, protocol)?;
    // Platforms that don't support `SOCK_NONBLOCK`.
    #[cfg(not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd"
    )))]
    socket.set_nonblocking(true)?;

    // Writes to a dead peer must surface EPIPE, not kill the process.
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    socket.set_nosigpipe(true)?;

    Ok(socket)
}

/// Borrows a raw descriptor as a `socket2::Socket` without taking
/// ownership.
pub(crate) fn with_socket<T>(fd: RawFd, f: impl FnOnce(&Socket) -> T) -> T {
    use std::os::fd::FromRawFd;
    // SAFETY: the fd stays owned by the caller; ManuallyDrop keeps the
    // temporary wrapper from closing it.
    let socket = std::mem::ManuallyDrop::new(unsafe { Socket::from_raw_fd(fd) });
    f(&socket)
}

pub(crate) fn to_sock_addr(endpoint: &Endpoint) -> io::Result<SockAddr> {
    match endpoint {
        Endpoint::V4(addr) => Ok(SockAddr::from(*addr)),
        Endpoint::V6(addr) => Ok(SockAddr::from(*addr)),
        Endpoint::Local(path) => SockAddr::unix(path),
    }
}

pub(crate) fn to_endpoint(addr: &SockAddr) -> io::Result<Endpoint> {
    if let Some(socket_addr) = addr.as_socket() {
        return Ok(Endpoint::from(socket_addr));
    }
    if let Some(path) = addr.as_pathname() {
        return Ok(Endpoint::local(path));
    }
    // An unnamed local socket formats as the empty path.
    if addr.is_unix() {
        return Ok(Endpoint::local(""));
    }
    Err(io::ErrorKind::InvalidInput.into())
}

pub(crate) fn bind(socket: &Socket, endpoint: &Endpoint) -> io::Result<()> {
    socket.bind(&to_sock_addr(endpoint)?)
}

/// Starts a connect. Returns true when the connection completed
/// synchronously, false when it is in progress and writability will report
/// the outcome.
pub(crate) fn connect(socket: &Socket, endpoint: &Endpoint) -> io::Result<bool> {
    match socket.connect(&to_sock_addr(endpoint)?) {
        Ok(()) => Ok(true),
        Err(ref err)
            if err.raw_os_error() == Some(libc::EINPROGRESS)
                || err.kind() == io::ErrorKind::WouldBlock =>
        {
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

pub(crate) fn listen(socket: &Socket, backlog: i32) -> io::Result<()> {
    socket.listen(backlog)
}

pub(crate) fn accept(socket: &Socket) -> io::Result<(Socket, Endpoint)> {
    let (accepted, addr) = socket.accept()?;
    accepted.set_nonblocking(true)?;
    let endpoint = to_endpoint(&addr)?;
    Ok((accepted, endpoint))
}

pub(crate) fn local_endpoint(socket: &Socket) -> io::Result<Endpoint> {
    socket.local_addr().and_then(|addr| to_endpoint(&addr))
}

pub(crate) fn peer_endpoint(socket: &Socket) -> io::Result<Endpoint> {
    socket.peer_addr().and_then(|addr| to_endpoint(&addr))
}

/// Retrieves and clears the pending `SO_ERROR` on the socket.
pub(crate) fn take_error(socket: &Socket) -> io::Result<Option<io::Error>> {
    socket.take_error()
}

pub(crate) fn shutdown(socket: &Socket, how: Shutdown) -> io::Result<()> {
    socket.shutdown(how)
}

#[cfg(any(target_os = "android", target_os = "linux"))]
fn send_flags() -> libc::c_int {
    libc::MSG_NOSIGNAL
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
fn send_flags() -> libc::c_int {
    0
}

/// Scatter-gather send. With `zero_copy` the kernel retains buffer
/// ownership until a completion arrives on the error queue.
pub(crate) fn send_vectored(fd: RawFd, bufs: &[IoSlice<'_>], zero_copy: bool) -> io::Result<usize> {
    let mut flags = send_flags();
    #[cfg(any(target_os = "android", target_os = "linux"))]
    if zero_copy {
        flags |= libc::MSG_ZEROCOPY;
    }
    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    let _ = zero_copy;

    // SAFETY: an all-zero msghdr is valid; iov pointers stay alive for the
    // duration of the call.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = bufs.len() as _;
    syscall!(sendmsg(fd, &msg, flags)).map(|n| n as usize)
}

/// Scatter-gather receive.
pub(crate) fn recv_vectored(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    syscall!(readv(
        fd,
        bufs.as_mut_ptr() as *mut libc::iovec,
        bufs.len() as libc::c_int,
    ))
    .map(|n| n as usize)
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], endpoint: &Endpoint) -> io::Result<usize> {
    let addr = to_sock_addr(endpoint)?;
    syscall!(sendto(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        send_flags(),
        addr.as_ptr() as *const libc::sockaddr,
        addr.len(),
    ))
    .map(|n| n as usize)
}

pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<Endpoint>)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        &mut addr_len,
    ))? as usize;

    // SAFETY: the kernel initialised `addr_len` bytes of the storage.
    let addr = unsafe {
        SockAddr::new(storage, addr_len)
    };
    let endpoint = to_endpoint(&addr).ok();
    Ok((n, endpoint))
}

/// Enables kernel zero-copy transmission for the socket.
#[cfg(any(target_os = "android", target_os = "linux"))]
pub(crate) fn set_zero_copy(socket: &Socket) -> io::Result<()> {
    let enable: libc::c_int = 1;
    syscall!(setsockopt(
        socket.as_raw_fd(),
        libc::SOL_SOCKET,
        libc::SO_ZEROCOPY,
        &enable as *const libc::c_int as *const libc::c_void,
        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
pub(crate) fn set_zero_copy(_socket: &Socket) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}

/// A completed zero-copy transmission range, in send-call sequence numbers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ZeroCopyRange {
    pub from: u32,
    pub to: u32,
    /// True when the kernel fell back to copying for this range.
    pub copied: bool,
}

/// Drains the socket error queue, returning completed zero-copy ranges.
///
/// Called when the engine reports notification readiness for a handle with
/// `Interest::NOTIFICATIONS`.
#[cfg(any(target_os = "android", target_os = "linux"))]
pub(crate) fn drain_notifications(fd: RawFd) -> io::Result<Vec<ZeroCopyRange>> {
    const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
    const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;

    let mut completions = Vec::new();
    loop {
        let mut control = [0u8; 128];
        // SAFETY: an all-zero msghdr is valid; the control buffer outlives
        // the call.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        let res = syscall!(recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE));
        match res {
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => return Err(err),
        }

        // SAFETY: the kernel filled the control buffer; CMSG_* walk it.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let level = (*cmsg).cmsg_level;
                let kind = (*cmsg).cmsg_type;
                let is_ip_recverr = (level == libc::SOL_IP && kind == libc::IP_RECVERR)
                    || (level == libc::SOL_IPV6 && kind == libc::IPV6_RECVERR);
                if is_ip_recverr {
                    let err = &*(libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err);
                    if err.ee_origin == SO_EE_ORIGIN_ZEROCOPY {
                        completions.push(ZeroCopyRange {
                            from: err.ee_info,
                            to: err.ee_data,
                            copied: err.ee_code == SO_EE_CODE_ZEROCOPY_COPIED,
                        });
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
    }
    Ok(completions)
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
pub(crate) fn drain_notifications(_fd: RawFd) -> io::Result<Vec<ZeroCopyRange>> {
    Ok(Vec::new())
}
