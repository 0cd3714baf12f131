//! Scheduling primitives: priorities, the ready set and the run token.

use core::fmt;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Highest usable thread priority.
pub const MAX_PRIORITY: u8 = 63;

/// Thread priority, unique system-wide.
///
/// Doubles as the thread's index into the ready set and the active-thread
/// registry. Higher values run first. Priority 0 is reserved for idle.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn is_valid(self) -> bool {
        self.0 >= 1 && self.0 <= MAX_PRIORITY
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// 64-bit bitmap of runnable priorities.
///
/// Membership implies "eligible to run now"; the running thread stays a
/// member until it blocks or returns. Uses leading_zeros for O(1) lookup of
/// the highest ready priority.
#[derive(Default, Clone, Copy)]
pub(crate) struct ReadySet {
    bits: u64,
}

impl ReadySet {
    pub(crate) fn insert(&mut self, prio: Priority) {
        debug_assert!(prio.is_valid());
        self.bits |= 1u64 << prio.0;
    }

    pub(crate) fn remove(&mut self, prio: Priority) {
        debug_assert!(prio.is_valid());
        self.bits &= !(1u64 << prio.0);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, prio: Priority) -> bool {
        (self.bits & (1u64 << prio.0)) != 0
    }

    /// Highest ready priority, or None when nothing is ready.
    pub(crate) fn max(&self) -> Option<Priority> {
        if self.bits == 0 {
            None
        } else {
            Some(Priority(63 - self.bits.leading_zeros() as u8))
        }
    }

    /// Highest ready priority strictly above the given ceiling.
    pub(crate) fn max_above(&self, ceiling: u8) -> Option<Priority> {
        self.max().filter(|p| p.0 > ceiling)
    }
}

/// Who currently holds the run token.
///
/// Exactly one participant executes at a time: either the kernel loop
/// (also the stand-in for interrupt/startup context) or one extended
/// thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Participant {
    Kernel,
    Thread(Priority),
}

/// Scheduler lock status, returned by [`Kernel::sched_lock`] and restored
/// by [`Kernel::sched_unlock`].
///
/// [`Kernel::sched_lock`]: crate::kernel::Kernel::sched_lock
/// [`Kernel::sched_unlock`]: crate::kernel::Kernel::sched_unlock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStatus {
    Unlocked,
    Locked(u8),
}

impl SchedStatus {
    pub fn is_locked(self) -> bool {
        matches!(self, Self::Locked(_))
    }
}
