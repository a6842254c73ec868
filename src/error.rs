//! The crate-wide error classification.
//!
//! A failed operating-system call is translated into the nearest kind at the
//! `sys` boundary and attached to the pending operation's event; operations
//! never panic on I/O failure, they signal through results and events.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds surfaced by every operation and event in the runtime.
///
/// `Unknown` carries the raw OS code for diagnostics when no mapping exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Operation aborted at the application's request.
    #[error("operation cancelled")]
    Cancelled,

    /// A non-blocking retry is needed, or a wait timed out.
    #[error("operation would block")]
    WouldBlock,

    /// A send deadline expired before the queue drained.
    #[error("send would block")]
    WouldBlockSend,

    /// A receive deadline expired before enough bytes arrived.
    #[error("receive would block")]
    WouldBlockReceive,

    /// A connect deadline expired before the peer answered.
    #[error("connect would block")]
    WouldBlockConnect,

    /// The peer closed its send side; no more data will arrive.
    #[error("end of file")]
    Eof,

    #[error("connection refused")]
    ConnectionRefused,

    /// The connection is no longer usable (broken pipe, aborted).
    #[error("connection dead")]
    ConnectionDead,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("host or network unreachable")]
    Unreachable,

    #[error("address in use")]
    AddressInUse,

    #[error("malformed address")]
    AddressMalformed,

    /// The operation is invalid in the socket's current state, or an
    /// argument is out of range.
    #[error("invalid operation or argument")]
    Invalid,

    /// A reservation (descriptors, connections, queue bytes) denied the
    /// operation.
    #[error("resource limit reached")]
    Limit,

    /// The feature is absent on the running platform.
    #[error("not implemented on this platform")]
    NotImplemented,

    /// An unmapped system error; the raw OS code is kept for diagnostics.
    #[error("unknown system error ({0})")]
    Unknown(i32),
}

impl Error {
    /// Translates a raw OS error code into the nearest kind.
    pub fn from_os(code: i32) -> Error {
        match code {
            libc::EAGAIN | libc::EINPROGRESS | libc::EALREADY => Error::WouldBlock,
            libc::ECANCELED => Error::Cancelled,
            libc::ECONNREFUSED => Error::ConnectionRefused,
            libc::ECONNRESET => Error::ConnectionReset,
            libc::EPIPE | libc::ECONNABORTED | libc::ENOTCONN => Error::ConnectionDead,
            libc::ENETUNREACH | libc::EHOSTUNREACH | libc::ENETDOWN | libc::EHOSTDOWN => {
                Error::Unreachable
            }
            libc::EADDRINUSE | libc::EADDRNOTAVAIL => Error::AddressInUse,
            libc::EAFNOSUPPORT | libc::EPROTONOSUPPORT => Error::AddressMalformed,
            libc::EINVAL | libc::EBADF | libc::EDESTADDRREQ | libc::EISCONN | libc::EMSGSIZE => {
                Error::Invalid
            }
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => Error::Limit,
            libc::ENOSYS | libc::EOPNOTSUPP => Error::NotImplemented,
            _ => Error::Unknown(code),
        }
    }

    /// Translates an `io::Error`, falling back on the error kind when no raw
    /// OS code is attached.
    pub fn from_io(err: &io::Error) -> Error {
        if let Some(code) = err.raw_os_error() {
            return Error::from_os(code);
        }
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::WouldBlock,
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected => {
                Error::ConnectionDead
            }
            io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable => Error::AddressInUse,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Error::Invalid,
            io::ErrorKind::UnexpectedEof => Error::Eof,
            io::ErrorKind::Unsupported => Error::NotImplemented,
            _ => Error::Unknown(0),
        }
    }

    /// True for the deadline/retry family of kinds.
    pub fn is_would_block(self) -> bool {
        matches!(
            self,
            Error::WouldBlock
                | Error::WouldBlockSend
                | Error::WouldBlockReceive
                | Error::WouldBlockConnect
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::from_io(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn os_code_translation() {
        assert_eq!(Error::from_os(libc::ECONNREFUSED), Error::ConnectionRefused);
        assert_eq!(Error::from_os(libc::EPIPE), Error::ConnectionDead);
        assert_eq!(Error::from_os(libc::EAGAIN), Error::WouldBlock);
        assert_eq!(Error::from_os(libc::EMFILE), Error::Limit);
        // An unmapped code keeps its raw value.
        assert_eq!(Error::from_os(libc::EXDEV), Error::Unknown(libc::EXDEV));
    }

    #[test]
    fn would_block_family() {
        assert!(Error::WouldBlockConnect.is_would_block());
        assert!(!Error::Eof.is_would_block());
    }
}
