//! Process identifiers as they appear in shared-memory records.
use core::fmt;

use dlb_pod::Pod;
use vasi::VirtualAddressSpaceIndependent;

/// A pid, or the absence of one. Stored as a raw `i32` (matching the OS pid
/// type) rather than `Option<i32>` so that `Pid` has a fixed, VASI-safe
/// layout and a well-defined all-zero-bytes-is-not-a-value bit pattern isn't
/// required.
#[derive(Copy, Clone, Eq, PartialEq, Hash, VirtualAddressSpaceIndependent)]
#[repr(transparent)]
pub struct Pid(i32);

unsafe impl Pod for Pid {}

impl Pid {
    /// Sentinel meaning "no process", used for unowned/unguested CPU slots.
    pub const NOBODY: Pid = Pid(0);

    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn is_nobody(self) -> bool {
        self.0 == 0
    }
}

impl Default for Pid {
    fn default() -> Self {
        Pid::NOBODY
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nobody() {
            write!(f, "NOBODY")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<i32> for Pid {
    fn from(raw: i32) -> Self {
        Pid::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nobody_is_default_and_zero() {
        assert_eq!(Pid::default(), Pid::NOBODY);
        assert!(Pid::NOBODY.is_nobody());
        assert!(!Pid::new(123).is_nobody());
    }
}
