//! Per-thread single-shot countdown timer.
//!
//! Every extended thread owns one timer, reused for both timed delays and
//! queue-wait timeouts. Armed timers are linked into a global per-tick-rate
//! expiry list walked by [`Kernel::tick`]; disarming is purely logical
//! (countdown to zero) and the physical unlink happens lazily during the
//! next tick walk. A timer can therefore stay linked while disarmed for up
//! to one tick; that confines all list-structure mutation to tick
//! processing.
//!
//! [`Kernel::tick`]: crate::kernel::Kernel::tick

use crate::fault::krequire;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const MODULE: &str = "timer";

/// Number of independent tick rates the kernel maintains.
pub const MAX_TICK_RATES: usize = 4;

/// Selects which periodic clock a timer counts against.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickRate(pub u8);

/// How long a blocking call is willing to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait for at most this many ticks (must be nonzero).
    Ticks(u32),
    /// Wait indefinitely; only an event or a cancel can end the wait.
    Never,
}

/// Why the timer will wake its owner, and whether it fired naturally.
///
/// Arming tags the timer with the blocking call that armed it; natural
/// expiry clears the tag back to `Cleared` so the woken thread can tell an
/// elapsed timeout from an external cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeSignal {
    Cleared,
    Delay,
    QueueWait,
}

pub(crate) struct Timer {
    /// Ticks remaining; zero means disarmed.
    pub(crate) ctr: u32,
    pub(crate) signal: WakeSignal,
    /// Whether the timer sits in the global expiry list for its rate.
    pub(crate) linked: bool,
    pub(crate) rate: TickRate,
}

impl Timer {
    pub(crate) fn new(rate: TickRate) -> Self {
        Self {
            ctr: 0,
            signal: WakeSignal::Cleared,
            linked: false,
            rate,
        }
    }

    /// Arms the timer for a blocking call.
    ///
    /// Returns true when the caller must link the timer into the global
    /// expiry list; re-arming a still-linked timer is deliberately a no-op
    /// on the list so tick processing stays the only list mutator.
    pub(crate) fn arm(&mut self, signal: WakeSignal, timeout: Timeout) -> bool {
        krequire!(MODULE, 700, self.ctr == 0);
        self.signal = signal;
        match timeout {
            Timeout::Never => false,
            Timeout::Ticks(ticks) => {
                krequire!(MODULE, 705, ticks != 0);
                self.ctr = ticks;
                if self.linked {
                    false
                } else {
                    self.linked = true;
                    true
                }
            }
        }
    }

    /// Logical disarm; reports whether the countdown was still running.
    pub(crate) fn disarm(&mut self) -> bool {
        if self.ctr != 0 {
            self.ctr = 0;
            true
        } else {
            false
        }
    }
}
