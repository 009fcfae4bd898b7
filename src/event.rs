use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::os::unix::io::RawFd;

/// Bitmask of channel operations a selection key can watch or report.
///
/// The same alphabet is used for interest sets and ready sets. Ready bits
/// are allowed to be a superset of the interest bits: the kernel may report
/// readiness the application did not ask for, and consumers must tolerate it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ops(u32);

impl Ops {
    pub const READ: Ops = Ops(1 << 0);
    pub const WRITE: Ops = Ops(1 << 2);
    pub const CONNECT: Ops = Ops(1 << 3);
    pub const ACCEPT: Ops = Ops(1 << 4);

    /// The empty operation set.
    pub const fn empty() -> Ops {
        Ops(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub(crate) const fn from_bits(bits: u32) -> Ops {
        Ops(bits)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is present in `self`.
    pub const fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if `self` and `other` share at least one bit.
    pub const fn intersects(self, other: Ops) -> bool {
        self.0 & other.0 != 0
    }

    /// Bits of `self` not present in `other`.
    pub const fn difference(self, other: Ops) -> Ops {
        Ops(self.0 & !other.0)
    }
}

impl BitOr for Ops {
    type Output = Ops;

    fn bitor(self, rhs: Ops) -> Ops {
        Ops(self.0 | rhs.0)
    }
}

impl BitAnd for Ops {
    type Output = Ops;

    fn bitand(self, rhs: Ops) -> Ops {
        Ops(self.0 & rhs.0)
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = Vec::new();
        if self.contains(Ops::READ) {
            names.push("READ");
        }
        if self.contains(Ops::WRITE) {
            names.push("WRITE");
        }
        if self.contains(Ops::CONNECT) {
            names.push("CONNECT");
        }
        if self.contains(Ops::ACCEPT) {
            names.push("ACCEPT");
        }
        if names.is_empty() {
            write!(f, "Ops()")
        } else {
            write!(f, "Ops({})", names.join("|"))
        }
    }
}

/// Readiness notification handed to event handlers by the reactor.
pub struct ReadyEvent {
    fd: RawFd,
    ready: Ops,
}

impl ReadyEvent {
    pub(crate) fn new(fd: RawFd, ready: Ops) -> Self {
        Self { fd, ready }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn ready_ops(&self) -> Ops {
        self.ready
    }

    pub fn is_readable(&self) -> bool {
        self.ready.intersects(Ops::READ | Ops::ACCEPT)
    }

    pub fn is_writable(&self) -> bool {
        self.ready.intersects(Ops::WRITE | Ops::CONNECT)
    }
}

impl fmt::Debug for ReadyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyEvent")
            .field("fd", &self.fd)
            .field("ready", &self.ready)
            .finish()
    }
}
