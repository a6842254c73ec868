//! The encryption session interface.
//!
//! The runtime fixes the event surface of upgrading a stream to TLS and
//! downgrading it back; the byte format and handshake logic live behind
//! [`EncryptionSession`], supplied by an external back-end.

use crate::Result;

/// Which side of the handshake the session drives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncryptionRole {
    Client,
    Server,
}

/// Bytes produced by feeding data into a session.
#[derive(Debug, Default)]
pub struct SessionOutput {
    /// Plaintext recovered from incoming ciphertext.
    pub plaintext: Vec<u8>,
    /// Ciphertext the session wants written to the peer (handshake records,
    /// acknowledgements, alerts).
    pub outgoing: Vec<u8>,
}

/// A TLS-style record-layer session.
///
/// The stream socket owns the session while an upgrade is active and
/// redirects its data plane through it: incoming bytes are pushed in and the
/// recovered plaintext is handed to receive callbacks; outgoing plaintext is
/// wrapped and the ciphertext enters the send queue.
pub trait EncryptionSession: Send {
    /// Starts the handshake, returning any initial records to transmit
    /// (empty for roles that speak second).
    fn initiate(&mut self, role: EncryptionRole) -> Result<Vec<u8>>;

    /// Feeds ciphertext received from the peer.
    fn push_incoming(&mut self, data: &[u8]) -> Result<SessionOutput>;

    /// Wraps application plaintext for transmission. Only valid once
    /// [`EncryptionSession::is_established`] reports true.
    fn wrap(&mut self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// True once the handshake completed and `wrap` may be used.
    fn is_established(&self) -> bool;

    /// Produces the session's close-notify record, beginning the send-side
    /// downgrade.
    fn close_notify(&mut self) -> Result<Vec<u8>>;

    /// True once the peer's close-notify was consumed by `push_incoming`.
    fn peer_closed(&self) -> bool;
}
