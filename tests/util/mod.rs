// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Once};
use std::time::Duration;

use netio::socket::event::{
    DowngradeEvent, ErrorEvent, ShutdownEvent, UpgradeEvent, WatermarkEvent,
};
use netio::tls::{EncryptionRole, EncryptionSession, SessionOutput};
use netio::{Error, Result, SocketSession};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Generous bound for anything the engine should deliver promptly.
pub const DELIVERY: Duration = Duration::from_secs(5);

/// A socket session observer that forwards everything onto a channel.
pub struct RecordingSession {
    sender: Sender<SessionRecord>,
}

#[derive(Debug)]
pub enum SessionRecord {
    Watermark(WatermarkEvent),
    Shutdown(ShutdownEvent),
    Upgrade(UpgradeEvent),
    Downgrade(DowngradeEvent),
    Error(ErrorEvent),
}

impl RecordingSession {
    pub fn new() -> (Arc<RecordingSession>, Receiver<SessionRecord>) {
        let (sender, receiver) = channel();
        (Arc::new(RecordingSession { sender }), receiver)
    }
}

impl SocketSession for RecordingSession {
    fn on_watermark(&self, event: WatermarkEvent) {
        let _ = self.sender.send(SessionRecord::Watermark(event));
    }

    fn on_shutdown(&self, event: ShutdownEvent) {
        let _ = self.sender.send(SessionRecord::Shutdown(event));
    }

    fn on_upgrade(&self, event: UpgradeEvent) {
        let _ = self.sender.send(SessionRecord::Upgrade(event));
    }

    fn on_downgrade(&self, event: DowngradeEvent) {
        let _ = self.sender.send(SessionRecord::Downgrade(event));
    }

    fn on_error(&self, event: ErrorEvent) {
        let _ = self.sender.send(SessionRecord::Error(event));
    }
}

const CLIENT_HELLO: &[u8] = b"XHELLO";
const SERVER_HELLO: &[u8] = b"XOLLEH";
const CLOSE_NOTIFY: &[u8] = b"XCLOSE";
const MASK: u8 = 0x5a;

/// A toy record-layer session: a fixed handshake token exchange followed by
/// XOR "encryption". Enough to exercise the upgrade and downgrade plumbing
/// without a real TLS back-end.
pub struct FakeEncryptionSession {
    role: Option<EncryptionRole>,
    buffer: Vec<u8>,
    established: bool,
    peer_closed: bool,
}

impl FakeEncryptionSession {
    pub fn new() -> Box<FakeEncryptionSession> {
        Box::new(FakeEncryptionSession {
            role: None,
            buffer: Vec::new(),
            established: false,
            peer_closed: false,
        })
    }
}

impl EncryptionSession for FakeEncryptionSession {
    fn initiate(&mut self, role: EncryptionRole) -> Result<Vec<u8>> {
        self.role = Some(role);
        match role {
            EncryptionRole::Client => Ok(CLIENT_HELLO.to_vec()),
            EncryptionRole::Server => Ok(Vec::new()),
        }
    }

    fn push_incoming(&mut self, data: &[u8]) -> Result<SessionOutput> {
        self.buffer.extend_from_slice(data);
        let mut output = SessionOutput::default();

        if !self.established {
            let expected: &[u8] = match self.role {
                Some(EncryptionRole::Client) => SERVER_HELLO,
                Some(EncryptionRole::Server) => CLIENT_HELLO,
                None => return Err(Error::Invalid),
            };
            if self.buffer.len() < expected.len() {
                return Ok(output);
            }
            if &self.buffer[..expected.len()] != expected {
                return Err(Error::Invalid);
            }
            self.buffer.drain(..expected.len());
            self.established = true;
            if self.role == Some(EncryptionRole::Server) {
                output.outgoing = SERVER_HELLO.to_vec();
            }
        }

        // Everything after the handshake is XOR ciphertext, except the
        // close-notify token.
        let mut plaintext: Vec<u8> = self.buffer.drain(..).map(|b| b ^ MASK).collect();
        if let Some(at) = find(&plaintext, &close_notify_plain()) {
            plaintext.truncate(at);
            self.peer_closed = true;
        }
        output.plaintext = plaintext;
        Ok(output)
    }

    fn wrap(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if !self.established {
            return Err(Error::Invalid);
        }
        Ok(plaintext.iter().map(|b| b ^ MASK).collect())
    }

    fn is_established(&self) -> bool {
        self.established
    }

    fn close_notify(&mut self) -> Result<Vec<u8>> {
        Ok(CLOSE_NOTIFY.to_vec())
    }

    fn peer_closed(&self) -> bool {
        self.peer_closed
    }
}

fn close_notify_plain() -> Vec<u8> {
    CLOSE_NOTIFY.iter().map(|b| b ^ MASK).collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}
