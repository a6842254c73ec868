//! Readiness events harvested from an engine's polling device.

use crate::Token;

const READABLE: u8 = 0b00_0001;
const WRITABLE: u8 = 0b00_0010;
const ERROR: u8 = 0b00_0100;
const READ_CLOSED: u8 = 0b00_1000;
const WRITE_CLOSED: u8 = 0b01_0000;
const NOTIFICATIONS: u8 = 0b10_0000;

/// A single readiness event.
///
/// Back-ends report events in their own wire shape (`epoll_event`,
/// `struct kevent`, `pollfd` revents); the selector normalizes them into
/// this form before the reactor dispatches them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    token: Token,
    flags: u8,
}

impl Event {
    pub(crate) fn new(token: Token, flags: u8) -> Event {
        Event { token, flags }
    }

    /// The token the handle was attached with.
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.flags & (READABLE | READ_CLOSED) != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & (WRITABLE | WRITE_CLOSED) != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & ERROR != 0
    }

    /// The peer shut down its send side, or both halves closed.
    pub fn is_read_closed(&self) -> bool {
        self.flags & READ_CLOSED != 0
    }

    pub fn is_write_closed(&self) -> bool {
        self.flags & WRITE_CLOSED != 0
    }

    /// An out-of-band notification (error-queue) is pending.
    pub fn is_notifications(&self) -> bool {
        self.flags & NOTIFICATIONS != 0
    }
}

/// Builder used by the selector back-ends.
#[derive(Default)]
pub(crate) struct EventFlags(u8);

impl EventFlags {
    pub(crate) fn new() -> EventFlags {
        EventFlags(0)
    }

    pub(crate) fn readable(mut self, on: bool) -> EventFlags {
        if on {
            self.0 |= READABLE;
        }
        self
    }

    pub(crate) fn writable(mut self, on: bool) -> EventFlags {
        if on {
            self.0 |= WRITABLE;
        }
        self
    }

    pub(crate) fn error(mut self, on: bool) -> EventFlags {
        if on {
            self.0 |= ERROR;
        }
        self
    }

    pub(crate) fn read_closed(mut self, on: bool) -> EventFlags {
        if on {
            self.0 |= READ_CLOSED;
        }
        self
    }

    pub(crate) fn write_closed(mut self, on: bool) -> EventFlags {
        if on {
            self.0 |= WRITE_CLOSED;
        }
        self
    }

    pub(crate) fn notifications(mut self, on: bool) -> EventFlags {
        if on {
            self.0 |= NOTIFICATIONS;
        }
        self
    }

    pub(crate) fn finish(self, token: Token) -> Event {
        Event::new(token, self.0)
    }
}

/// A buffer of readiness events.
///
/// The capacity bounds how many events one call to the polling device may
/// return; further pending events are returned by the next call.
#[derive(Debug)]
pub struct Events {
    inner: Vec<Event>,
    capacity: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.inner.iter()
    }

    pub(crate) fn clear(&mut self) {
        self.inner.clear();
    }

    pub(crate) fn push(&mut self, event: Event) {
        self.inner.push(event);
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}
