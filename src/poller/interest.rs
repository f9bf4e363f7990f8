//! Interest flags for I/O readiness.

use std::ops::BitOr;

/// Interest flags indicating what I/O events to monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    /// No interest; the registration is kept but never fires.
    pub const NONE: Interest = Interest(0);
    /// Interest in readable events.
    pub const READABLE: Interest = Interest(0b01);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Interest(0b10);

    /// Returns interest in both readable and writable events.
    #[must_use]
    pub const fn both() -> Self {
        Interest(0b11)
    }

    /// Returns true if readable interest is set.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable interest is set.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns true if no flag is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Combines interests.
    #[must_use]
    pub const fn add(self, other: Interest) -> Self {
        Interest(self.0 | other.0)
    }

    /// Removes interest.
    #[must_use]
    pub const fn remove(self, other: Interest) -> Self {
        Interest(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.add(rhs)
    }
}
