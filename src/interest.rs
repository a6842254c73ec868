use std::num::NonZeroU8;
use std::{fmt, ops};

/// Interest used when attaching and monitoring handles.
///
/// Interest records what the engine must report for a handle: readiness for
/// reading or writing, out-of-band notifications (the socket error queue),
/// and the trigger discipline (level by default, `EDGE` and `ONESHOT` as
/// modifiers).
///
/// The size of `Option<Interest>` is identical to `Interest` itself.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

// These must be unique.
const READABLE: u8 = 0b0_0001;
const WRITABLE: u8 = 0b0_0010;
const NOTIFICATIONS: u8 = 0b0_0100;
const EDGE: u8 = 0b0_1000;
const ONESHOT: u8 = 0b1_0000;

impl Interest {
    /// Interest in readability of the handle.
    pub const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });

    /// Interest in writability of the handle.
    pub const WRITABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });

    /// Interest in the handle's notification queue (error-queue events such
    /// as transmit timestamps and zero-copy completions).
    pub const NOTIFICATIONS: Interest = Interest(unsafe { NonZeroU8::new_unchecked(NOTIFICATIONS) });

    /// Edge-triggered delivery. Only supported by the `epoll` and `kqueue`
    /// back-ends.
    pub const EDGE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(EDGE) });

    /// One-shot delivery: the interest is disarmed after the first event and
    /// must be shown again.
    pub const ONESHOT: Interest = Interest(unsafe { NonZeroU8::new_unchecked(ONESHOT) });

    /// Add together two `Interest`s.
    ///
    /// This does a bitwise OR of the two interests; it is a `const` stand-in
    /// for the `|` operator.
    #[must_use]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    /// Removes `other` from `self`, returning `None` if nothing is left.
    #[must_use]
    pub fn remove(self, other: Interest) -> Option<Interest> {
        NonZeroU8::new(self.0.get() & !other.0.get()).map(Interest)
    }

    pub const fn is_readable(self) -> bool {
        (self.0.get() & READABLE) != 0
    }

    pub const fn is_writable(self) -> bool {
        (self.0.get() & WRITABLE) != 0
    }

    pub const fn is_notifications(self) -> bool {
        (self.0.get() & NOTIFICATIONS) != 0
    }

    pub const fn is_edge(self) -> bool {
        (self.0.get() & EDGE) != 0
    }

    pub const fn is_oneshot(self) -> bool {
        (self.0.get() & ONESHOT) != 0
    }

    /// True if any of `other`'s bits are contained in `self`.
    pub const fn intersects(self, other: Interest) -> bool {
        (self.0.get() & other.0.get()) != 0
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 = (*self | other).0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?
            }
            write!(fmt, "WRITABLE")?;
            one = true
        }
        if self.is_notifications() {
            if one {
                write!(fmt, " | ")?
            }
            write!(fmt, "NOTIFICATIONS")?;
            one = true
        }
        if self.is_edge() {
            if one {
                write!(fmt, " | ")?
            }
            write!(fmt, "EDGE")?;
            one = true
        }
        if self.is_oneshot() {
            if one {
                write!(fmt, " | ")?
            }
            write!(fmt, "ONESHOT")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn add_and_remove() {
        let rw = Interest::READABLE | Interest::WRITABLE;
        assert!(rw.is_readable());
        assert!(rw.is_writable());
        assert!(!rw.is_edge());

        let r = rw.remove(Interest::WRITABLE).unwrap();
        assert!(r.is_readable());
        assert!(!r.is_writable());
        assert!(r.remove(Interest::READABLE).is_none());
    }

    #[test]
    fn option_size() {
        use std::mem::size_of;
        assert_eq!(size_of::<Option<Interest>>(), size_of::<Interest>());
    }
}
