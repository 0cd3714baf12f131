//! Extended threads: blocking procedures with a private event queue.
//!
//! An extended thread runs an ordinary blocking procedure instead of a
//! run-to-completion state handler. Inside the procedure it may wait on its
//! built-in event queue with [`XThreadContext::receive`] and sleep with
//! [`XThreadContext::delay`]; other participants reach it through a cloneable
//! [`ThreadHandle`].

use std::fmt;
use std::sync::Arc;

use crate::event::DynEvent;
use crate::fault::{kfault, krequire};
use crate::kernel::{current_priority, BlockReason, Kernel, KernelShared};
use crate::sched::{Participant, Priority};
use crate::timer::{TickRate, Timeout, WakeSignal, MAX_TICK_RATES};

const MODULE: &str = "xthread";

/// The thread procedure. Runs once; the thread deregisters when it returns.
pub type XThreadHandler = Box<dyn FnOnce(&XThreadContext) + Send + 'static>;

/// An extended thread before it is started.
pub struct XThread {
    pub(crate) handler: XThreadHandler,
    pub(crate) tick_rate: TickRate,
}

impl XThread {
    /// Binds a procedure to the tick rate its private timer counts against.
    pub fn new(handler: XThreadHandler, tick_rate: TickRate) -> Self {
        krequire!(MODULE, 100, (tick_rate.0 as usize) < MAX_TICK_RATES);
        Self { handler, tick_rate }
    }
}

impl fmt::Debug for XThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XThread")
            .field("tick_rate", &self.tick_rate)
            .finish_non_exhaustive()
    }
}

/// Delivery guarantee demanded by a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Margin {
    /// Delivery is guaranteed by design; failure to deliver is fatal.
    None,
    /// Deliver only if at least this many free slots remain after the
    /// insertion; otherwise the event is dropped and the post reports
    /// failure.
    Free(u16),
}

/// Anything events can be posted to.
pub trait EventTarget {
    fn priority(&self) -> Priority;

    /// Posts an event in FIFO order, honoring the margin policy.
    fn post(&self, event: DynEvent, margin: Margin) -> bool;

    /// Posts an event ahead of everything already queued. Not every target
    /// kind supports it.
    fn post_lifo(&self, event: DynEvent);
}

/// Cloneable reference to a started extended thread.
pub struct ThreadHandle {
    shared: Arc<KernelShared>,
    prio: Priority,
}

impl Clone for ThreadHandle {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            prio: self.prio,
        }
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle").field("prio", &self.prio).finish()
    }
}

impl ThreadHandle {
    pub(crate) fn new(shared: Arc<KernelShared>, prio: Priority) -> Self {
        Self { shared, prio }
    }

    pub fn priority(&self) -> Priority {
        self.prio
    }

    /// Posts an event to the thread's built-in queue.
    ///
    /// Returns false when the thread already returned from its procedure,
    /// or when a [`Margin::Free`] requirement cannot be met; the event is
    /// dropped in both cases. Posting to a thread started without a queue
    /// is fatal, as is a [`Margin::None`] post that finds no free slot.
    pub fn post(&self, event: DynEvent, margin: Margin) -> bool {
        post_fifo(&self.shared, self.prio, event, margin)
    }

    /// Cancels an in-progress [`XThreadContext::delay`] and wakes the
    /// thread early. Returns true when a delay was actually cut short.
    pub fn delay_cancel(&self) -> bool {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        let was_counting = match st.slots[self.prio.index()].as_mut() {
            Some(slot) if slot.blocking == Some(BlockReason::Timer) => slot.timer.disarm(),
            _ => return false,
        };
        log::trace!("delay cancelled for xthread {}", self.prio);
        shared.unblock(&mut st, self.prio);
        was_counting
    }

    /// Free slots in the thread's queue, or None once the thread returned.
    pub fn queue_free(&self) -> Option<usize> {
        let st = self.shared.state.lock();
        st.slots[self.prio.index()].as_ref().map(|s| s.queue.free())
    }

    /// Low watermark of the queue's free count, or None once the thread
    /// returned.
    pub fn queue_min_free(&self) -> Option<usize> {
        let st = self.shared.state.lock();
        st.slots[self.prio.index()]
            .as_ref()
            .map(|s| s.queue.min_free())
    }
}

impl EventTarget for ThreadHandle {
    fn priority(&self) -> Priority {
        self.prio
    }

    fn post(&self, event: DynEvent, margin: Margin) -> bool {
        ThreadHandle::post(self, event, margin)
    }

    fn post_lifo(&self, event: DynEvent) {
        // extended threads consume their queue strictly in FIFO order
        drop(event);
        kfault!(MODULE, 410);
    }
}

/// Execution context passed to the thread procedure.
///
/// Only the owning thread holds it, so the blocking operations are
/// inherently called from the right thread of control.
pub struct XThreadContext {
    shared: Arc<KernelShared>,
    prio: Priority,
}

impl XThreadContext {
    pub(crate) fn new(shared: Arc<KernelShared>, prio: Priority) -> Self {
        Self { shared, prio }
    }

    pub fn priority(&self) -> Priority {
        self.prio
    }

    /// Handle to this thread, for passing to peers before blocking.
    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle::new(Arc::clone(&self.shared), self.prio)
    }

    /// Kernel handle, for ticks, scheduler locking or starting peers.
    pub fn kernel(&self) -> Kernel {
        Kernel::from_shared(Arc::clone(&self.shared))
    }

    /// Waits for an event from the thread's built-in queue.
    ///
    /// Returns immediately when an event is already pending. Otherwise the
    /// thread suspends until a post arrives or the timeout elapses; a
    /// timeout yields None. Fatal when called while holding the scheduler
    /// lock or while the thread is already blocked.
    pub fn receive(&self, timeout: Timeout) -> Option<DynEvent> {
        let me = self.prio;
        let shared = &self.shared;
        let mut st = shared.state.lock();
        krequire!(
            MODULE,
            500,
            st.running == Participant::Thread(me)
                && current_priority() == Some(me)
                && st.lock_holder != Some(me)
                && st.expect_slot(me).blocking.is_none()
        );

        if st.expect_slot(me).queue.is_empty() {
            st.expect_slot_mut(me).blocking = Some(BlockReason::Queue);
            st.arm_thread_timer(me, WakeSignal::QueueWait, timeout);
            st.ready.remove(me);
            log::trace!("xthread {me} blocking on its queue ({timeout:?})");
            shared.block_current(&mut st, me);
            // the wakeup must have come from this queue or its timeout
            krequire!(
                MODULE,
                510,
                st.expect_slot(me).blocking == Some(BlockReason::Queue)
            );
            st.expect_slot_mut(me).blocking = None;
        }

        let event = st.expect_slot_mut(me).queue.get();
        match &event {
            Some(e) => log::trace!("xthread {me} received {}", e.signal()),
            None => log::trace!("xthread {me} queue wait timed out"),
        }
        event
    }

    /// Suspends the thread for the given number of ticks of its tick rate.
    ///
    /// Returns true when the full delay elapsed and false when it was cut
    /// short by [`ThreadHandle::delay_cancel`]. Fatal when called while
    /// holding the scheduler lock or with a zero tick count.
    pub fn delay(&self, ticks: u32) -> bool {
        let me = self.prio;
        let shared = &self.shared;
        let mut st = shared.state.lock();
        krequire!(
            MODULE,
            800,
            st.running == Participant::Thread(me)
                && current_priority() == Some(me)
                && st.lock_holder != Some(me)
                && st.expect_slot(me).blocking.is_none()
        );

        st.expect_slot_mut(me).blocking = Some(BlockReason::Timer);
        st.arm_thread_timer(me, WakeSignal::Delay, Timeout::Ticks(ticks));
        st.ready.remove(me);
        log::trace!("xthread {me} delaying for {ticks} ticks");
        shared.block_current(&mut st, me);
        // the wakeup must have come from this thread's timer
        krequire!(
            MODULE,
            890,
            st.expect_slot(me).blocking == Some(BlockReason::Timer)
        );
        st.expect_slot_mut(me).blocking = None;

        // natural expiry clears the wake signal; a cancel leaves it set
        st.expect_slot(me).timer.signal == WakeSignal::Cleared
    }
}

fn post_fifo(shared: &KernelShared, target: Priority, event: DynEvent, margin: Margin) -> bool {
    let signal = event.signal();
    let mut st = shared.state.lock();

    if st.slots[target.index()].is_none() {
        // the target returned from its procedure; delivery is permanently off
        drop(st);
        log::warn!("post of {signal} to stopped xthread {target} dropped");
        return false;
    }

    if !st.expect_slot(target).queue.is_available() {
        drop(event);
        kfault!(MODULE, 320);
    }

    let n_free = st.expect_slot(target).queue.free();
    let accepted = match margin {
        Margin::None => {
            // guaranteed delivery must be assured by static queue sizing
            krequire!(MODULE, 310, n_free > 0);
            true
        }
        Margin::Free(required) => n_free > required as usize,
    };
    if !accepted {
        drop(st);
        log::warn!("queue full: {signal} to xthread {target} dropped ({margin:?})");
        return false;
    }

    let (went_front, was_waiting) = {
        let slot = st.expect_slot_mut(target);
        let went_front = slot.queue.insert_fifo(event);
        (went_front, slot.blocking == Some(BlockReason::Queue))
    };
    log::trace!(
        "posted {signal} to xthread {target} (free {})",
        st.expect_slot(target).queue.free()
    );

    if went_front && was_waiting {
        // the receiver is blocked on exactly this queue; kill its timeout
        // and make it ready, leaving the blocking tag for it to clear
        st.expect_slot_mut(target).timer.disarm();
        shared.unblock(&mut st, target);
    }
    true
}
