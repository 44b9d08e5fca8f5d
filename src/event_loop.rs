//! Binding to the host's readiness-based event loop.
//!
//! A [`Connection`](crate::Connection) never waits on anything itself. It asks
//! its [`EventLoop`] to watch a descriptor or arm a timer under the
//! connection's [`Token`], and the host hands the resulting [`Event`]s back
//! through [`Connection::handle`](crate::Connection::handle).

use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::os::fd::RawFd;
use std::time::Duration;

/// Readiness a registration is interested in, or that an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Interest(u8);

impl Interest {
    /// No interest (empty set).
    pub const NONE: Self = Self(0);

    pub const READABLE: Self = Self(1 << 0);

    pub const WRITABLE: Self = Self(1 << 1);

    /// Both readable and writable.
    pub const BOTH: Self = Self(Self::READABLE.0 | Self::WRITABLE.0);

    #[must_use]
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_readable(&self) -> bool {
        (self.0 & Self::READABLE.0) != 0
    }

    #[must_use]
    pub const fn is_writable(&self) -> bool {
        (self.0 & Self::WRITABLE.0) != 0
    }

    /// This set with the flags in `other` removed.
    #[must_use]
    pub const fn remove(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for Interest {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::BOTH.0)
    }
}

/// Identifies one connection's registration and timer inside an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// Something the event loop observed for a [`Token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The descriptor is ready. Errors and hang-ups are reported as readiness
    /// in every registered direction so the next I/O call surfaces them.
    Ready(Interest),
    /// The one-shot timer fired.
    Timer,
    /// A `deregister` call completed; the descriptor is no longer watched
    /// and may be closed.
    Deregistered,
}

/// Services a [`Connection`](crate::Connection) needs from its event loop.
///
/// All operations return immediately; outcomes arrive later as [`Event`]s.
pub trait EventLoop {
    /// Start watching `fd` for `interest`.
    fn register(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Replace the interest of an existing registration. `Interest::NONE`
    /// keeps the registration but reports nothing.
    fn reregister(&mut self, token: Token, interest: Interest) -> io::Result<()>;

    /// Stop watching the descriptor. Completion is signalled with
    /// [`Event::Deregistered`]; until then the descriptor must stay open.
    fn deregister(&mut self, token: Token) -> io::Result<()>;

    /// Arm the one-shot timer for `token`, replacing any armed one.
    fn start_timer(&mut self, token: Token, after: Duration) -> io::Result<()>;

    /// Disarm the timer for `token`, if armed.
    fn stop_timer(&mut self, token: Token);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_ops() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert_eq!(both, Interest::BOTH);
        assert!(both.contains(Interest::READABLE));
        assert_eq!(both.remove(Interest::WRITABLE), Interest::READABLE);
        assert_eq!(!Interest::READABLE, Interest::WRITABLE);
        assert_eq!(both & Interest::WRITABLE, Interest::WRITABLE);
        assert!(Interest::NONE.is_empty());

        let mut interest = Interest::NONE;
        interest |= Interest::WRITABLE;
        assert!(interest.is_writable() && !interest.is_readable());
    }
}
