//! Readiness multiplexing.
//!
//! This module defines the capability the dispatcher needs from the OS
//! (register, deregister, wait) as the [`Multiplexer`] trait, and provides
//! [`PollMultiplexer`], a level-triggered `poll(2)` backend.

mod poll_backend;

pub use poll_backend::PollMultiplexer;

use std::fmt;
use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Opaque owner reference attached to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// Set of operations a registration is interested in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    /// No operations. The descriptor stays registered and only hang-up and
    /// error conditions are reported.
    pub const NONE: Interest = Interest(0);
    /// Data can be read.
    pub const READABLE: Interest = Interest(0b001);
    /// Data can be written, or a pending connect finished.
    pub const WRITABLE: Interest = Interest(0b010);
    /// A listening descriptor has pending connections.
    pub const ACCEPTABLE: Interest = Interest(0b100);

    /// True if no operation is selected.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_acceptable(self) -> bool {
        self.0 & Self::ACCEPTABLE.0 != 0
    }

    /// Returns the union of both sets.
    pub fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// Returns `self` without the operations in `other`.
    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.is_acceptable() {
            parts.push("ACCEPTABLE");
        }
        if self.is_readable() {
            parts.push("READABLE");
        }
        if self.is_writable() {
            parts.push("WRITABLE");
        }
        if parts.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", parts.join(" | "))
        }
    }
}

/// Set of operations reported ready for a registration.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b00001);
    pub const WRITABLE: Ready = Ready(0b00010);
    pub const ACCEPTABLE: Ready = Ready(0b00100);
    /// The descriptor reported an error or is no longer valid.
    pub const ERROR: Ready = Ready(0b01000);
    /// The peer hung up.
    pub const HANGUP: Ready = Ready(0b10000);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_acceptable(self) -> bool {
        self.0 & Self::ACCEPTABLE.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub fn is_hangup(self) -> bool {
        self.0 & Self::HANGUP.0 != 0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ready")
            .field("acceptable", &self.is_acceptable())
            .field("readable", &self.is_readable())
            .field("writable", &self.is_writable())
            .field("error", &self.is_error())
            .field("hangup", &self.is_hangup())
            .finish()
    }
}

/// One entry of a wait batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Owner of the ready registration.
    pub token: Token,

    /// Operations that are ready.
    pub ready: Ready,
}

/// OS readiness polling capability.
///
/// Implementations keep at most one registration per descriptor.
pub trait Multiplexer {
    /// Adds a registration, or replaces the interest and token of an existing one.
    fn register(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()>;

    /// Removes a registration. Unknown descriptors are ignored.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Blocks for up to `timeout` (forever if `None`) and fills `events`.
    ///
    /// Returns immediately if something is already ready. An expired
    /// timeout leaves `events` empty and is not an error. A descriptor that
    /// became invalid is reported with [`Ready::ERROR`] instead of failing
    /// the whole call. An `Err` means the polling primitive itself failed.
    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()>;
}
