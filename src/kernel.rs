//! Process-wide kernel context and scheduler.
//!
//! The kernel owns every piece of shared scheduling state: the
//! active-thread registry (indexed by priority), the ready set, the
//! per-tick-rate timer lists and the scheduler lock. All of it lives behind
//! one mutex (the critical section), and no operation suspends while
//! holding it.
//!
//! ## Execution model
//!
//! Each extended thread runs on its own host thread, but exactly one
//! participant executes at a time: either the kernel loop (which doubles as
//! the startup/interrupt context) or one extended thread. A single "run
//! token" is handed between participants through a condition variable; the
//! handoff is the stand-in for the raw context-switch primitive. A thread
//! that blocks picks the next token holder and waits until it is scheduled
//! again, so a strictly-higher-priority thread made ready by a post always
//! preempts the poster before the poster resumes.
//!
//! Posts and tick advances from outside any extended thread (the interrupt
//! analogue) only update state; the woken threads actually run during the
//! next [`Kernel::run_to_idle`] call, mirroring scheduling deferred to the
//! interrupt-exit path.

use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::fault::{kfault, krequire};
use crate::queue::EventQueue;
use crate::sched::{Participant, Priority, ReadySet, SchedStatus};
use crate::thread::{ThreadHandle, XThread, XThreadContext};
use crate::timer::{TickRate, Timeout, Timer, WakeSignal, MAX_TICK_RATES};

const MODULE: &str = "kernel";

thread_local! {
    /// Priority of the extended thread executing on this host thread.
    static CURRENT: Cell<Option<Priority>> = const { Cell::new(None) };
}

/// Priority of the calling extended thread, if any.
pub(crate) fn current_priority() -> Option<Priority> {
    CURRENT.with(|c| c.get())
}

/// The waitable a suspended thread is blocked on.
///
/// Both waitables are owned by the thread itself, so a tag is enough to
/// identify the blocking object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockReason {
    Queue,
    Timer,
}

/// Registry entry for one started extended thread.
pub(crate) struct ThreadSlot {
    pub(crate) queue: EventQueue,
    pub(crate) timer: Timer,
    /// Some iff the thread is currently suspended.
    pub(crate) blocking: Option<BlockReason>,
    /// Priority handed to the registry at start; keyed for deregistration.
    pub(crate) start_prio: Priority,
}

pub(crate) struct KernelState {
    pub(crate) slots: Vec<Option<ThreadSlot>>,
    pub(crate) ready: ReadySet,
    pub(crate) timer_lists: [Vec<Priority>; MAX_TICK_RATES],
    pub(crate) running: Participant,
    pub(crate) lock_ceiling: u8,
    pub(crate) lock_holder: Option<Priority>,
    /// First panic payload captured from a thread procedure, re-raised by
    /// [`Kernel::run_to_idle`].
    panicked: Option<Box<dyn Any + Send>>,
}

impl KernelState {
    fn new() -> Self {
        Self {
            slots: (0..=crate::sched::MAX_PRIORITY as usize).map(|_| None).collect(),
            ready: ReadySet::default(),
            timer_lists: std::array::from_fn(|_| Vec::new()),
            running: Participant::Kernel,
            lock_ceiling: 0,
            lock_holder: None,
            panicked: None,
        }
    }

    /// Registry lookup for a priority that must be occupied.
    pub(crate) fn expect_slot(&self, prio: Priority) -> &ThreadSlot {
        match self.slots[prio.index()].as_ref() {
            Some(slot) => slot,
            None => kfault!(MODULE, 105),
        }
    }

    pub(crate) fn expect_slot_mut(&mut self, prio: Priority) -> &mut ThreadSlot {
        match self.slots[prio.index()].as_mut() {
            Some(slot) => slot,
            None => kfault!(MODULE, 105),
        }
    }

    /// Arms a thread's private timer and links it into the expiry list for
    /// its tick rate when the timer is not already linked.
    pub(crate) fn arm_thread_timer(
        &mut self,
        prio: Priority,
        signal: WakeSignal,
        timeout: Timeout,
    ) {
        let slot = self.expect_slot_mut(prio);
        let needs_link = slot.timer.arm(signal, timeout);
        let rate = slot.timer.rate;
        if needs_link {
            self.timer_lists[rate.0 as usize].push(prio);
        }
    }
}

pub(crate) struct KernelShared {
    pub(crate) state: Mutex<KernelState>,
    pub(crate) resume: Condvar,
    pub(crate) config: KernelConfig,
}

impl KernelShared {
    /// Hands the run token to `next` and waits until this thread holds it
    /// again. Must be called by the thread that currently holds the token.
    fn switch_and_wait(
        &self,
        st: &mut MutexGuard<'_, KernelState>,
        me: Priority,
        next: Participant,
    ) {
        log::trace!("context switch {:?} -> {next:?}", st.running);
        st.running = next;
        self.resume.notify_all();
        while st.running != Participant::Thread(me) {
            self.resume.wait(st);
        }
    }

    fn next_participant(st: &KernelState) -> Participant {
        st.ready
            .max_above(st.lock_ceiling)
            .map(Participant::Thread)
            .unwrap_or(Participant::Kernel)
    }

    /// Suspends the calling thread after it removed itself from the ready
    /// set; control returns only when the scheduler selects it again.
    pub(crate) fn block_current(&self, st: &mut MutexGuard<'_, KernelState>, me: Priority) {
        let next = Self::next_participant(st);
        self.switch_and_wait(st, me, next);
    }

    /// Releases the run token without waiting; used when a thread returns
    /// from its procedure.
    pub(crate) fn retire_current(&self, st: &mut MutexGuard<'_, KernelState>) {
        let next = Self::next_participant(st);
        st.running = next;
        self.resume.notify_all();
    }

    /// Scheduler invocation point.
    ///
    /// A no-op unless the caller is the running thread and a strictly
    /// higher-priority thread (above the lock ceiling) became ready; in
    /// that case the caller is preempted until re-selected. Calls from
    /// outside any extended thread defer scheduling to the next
    /// [`Kernel::run_to_idle`] pass.
    pub(crate) fn schedule(&self, st: &mut MutexGuard<'_, KernelState>) {
        if let Participant::Thread(me) = st.running {
            if current_priority() == Some(me) {
                if let Some(next) = st.ready.max_above(st.lock_ceiling) {
                    if next != me {
                        self.switch_and_wait(st, me, Participant::Thread(next));
                    }
                }
            }
        }
    }

    /// Makes `target` ready and invokes the scheduler.
    pub(crate) fn unblock(&self, st: &mut MutexGuard<'_, KernelState>, target: Priority) {
        st.ready.insert(target);
        self.schedule(st);
    }
}

/// Kernel-wide configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub name: &'static str,
    /// Invoked by [`Kernel::run_to_idle`] when nothing is ready.
    pub idle_callback: Option<fn()>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "xkern",
            idle_callback: None,
        }
    }
}

impl KernelConfig {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn with_idle_callback(mut self, callback: fn()) -> Self {
        self.idle_callback = Some(callback);
        self
    }
}

/// Handle to the process-wide kernel context.
///
/// Cheap to clone; all clones share the same registry, ready set and timer
/// lists.
pub struct Kernel {
    shared: Arc<KernelShared>,
}

impl Clone for Kernel {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        Self {
            shared: Arc::new(KernelShared {
                state: Mutex::new(KernelState::new()),
                resume: Condvar::new(),
                config,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<KernelShared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.shared.config
    }

    /// Starts an extended thread.
    ///
    /// Preconditions (fatal): `priority` is in range and unused by any
    /// other thread, and `stack_size` is nonzero. The thread becomes ready
    /// immediately; when started from another extended thread it may
    /// preempt the caller right away, otherwise it first runs during the
    /// next [`Kernel::run_to_idle`] pass.
    ///
    /// `queue_capacity` sizes the ring of the private event queue; zero
    /// means the thread has no built-in queue and posting to it is a
    /// contract violation.
    pub fn start(
        &self,
        thread: XThread,
        priority: Priority,
        queue_capacity: usize,
        stack_size: usize,
    ) -> ThreadHandle {
        let XThread { handler, tick_rate } = thread;

        let mut st = self.shared.state.lock();
        krequire!(
            MODULE,
            200,
            priority.is_valid() && stack_size != 0 && st.slots[priority.index()].is_none()
        );

        st.slots[priority.index()] = Some(ThreadSlot {
            queue: EventQueue::new(queue_capacity),
            timer: Timer::new(tick_rate),
            blocking: None,
            start_prio: priority,
        });

        // prepare the execution context: the host thread parks until the
        // scheduler hands it the run token for the first time
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("xthread-{priority}"))
            .stack_size(stack_size)
            .spawn(move || {
                {
                    let mut st = shared.state.lock();
                    while st.running != Participant::Thread(priority) {
                        shared.resume.wait(&mut st);
                    }
                }
                CURRENT.with(|c| c.set(Some(priority)));
                let ctx = XThreadContext::new(Arc::clone(&shared), priority);
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(&ctx)));

                let mut st = shared.state.lock();
                if let Err(payload) = outcome {
                    // the procedure panicked: force-release what it held and
                    // surface the payload at the kernel loop
                    if st.lock_holder == Some(priority) {
                        st.lock_holder = None;
                        st.lock_ceiling = 0;
                    }
                    st.slots[priority.index()] = None;
                    st.ready.remove(priority);
                    if st.panicked.is_none() {
                        st.panicked = Some(payload);
                    }
                    log::error!("xthread {priority} panicked; deregistered");
                    shared.retire_current(&mut st);
                    return;
                }

                // the procedure returned: deregister and hand the token on
                krequire!(
                    MODULE,
                    900,
                    st.expect_slot(priority).blocking.is_none()
                        && st.lock_holder != Some(priority)
                );
                let start_prio = st.expect_slot(priority).start_prio;
                st.slots[start_prio.index()] = None;
                st.ready.remove(priority);
                log::debug!("xthread {priority} returned and deregistered");
                shared.retire_current(&mut st);
            });
        if let Err(err) = spawned {
            log::error!("spawning host thread for {priority} failed: {err}");
            st.slots[priority.index()] = None;
            kfault!(MODULE, 210);
        }

        st.ready.insert(priority);
        log::debug!(
            "[{}] xthread {priority} started (queue {queue_capacity}, stack {stack_size})",
            self.shared.config.name
        );
        self.shared.schedule(&mut st);
        drop(st);

        ThreadHandle::new(Arc::clone(&self.shared), priority)
    }

    /// Runs ready threads until everything is blocked or returned.
    ///
    /// Must be called from outside any extended thread. Hands the run
    /// token to the highest-priority ready thread and regains it only once
    /// no thread is ready, then invokes the configured idle callback. A
    /// panic raised inside a thread procedure (including a contract
    /// violation) is re-raised here on the caller's thread.
    pub fn run_to_idle(&self) {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        krequire!(MODULE, 100, st.running == Participant::Kernel);

        while let Some(next) = st.ready.max_above(st.lock_ceiling) {
            log::trace!("scheduling xthread {next}");
            st.running = Participant::Thread(next);
            shared.resume.notify_all();
            while st.running != Participant::Kernel {
                shared.resume.wait(&mut st);
            }
        }
        if let Some(payload) = st.panicked.take() {
            drop(st);
            resume_unwind(payload);
        }
        drop(st);

        log::trace!("[{}] idle", self.shared.config.name);
        if let Some(idle) = self.shared.config.idle_callback {
            idle();
        }
    }

    /// Advances the clock of the given tick rate by one tick.
    ///
    /// Walks the expiry list: disarmed timers are unlinked here and only
    /// here; armed timers count down, and a timer reaching zero delivers
    /// its private expiry wakeup directly to the owner (never through the
    /// ring buffer), clearing the wake signal and unblocking the thread.
    pub fn tick(&self, rate: TickRate) {
        krequire!(MODULE, 110, (rate.0 as usize) < MAX_TICK_RATES);
        let shared = &self.shared;
        let mut st = shared.state.lock();

        let list = std::mem::take(&mut st.timer_lists[rate.0 as usize]);
        let mut kept = Vec::with_capacity(list.len());
        for prio in list {
            let fired = match st.slots[prio.index()].as_mut() {
                // owner returned while linked; drop the stale link
                None => continue,
                Some(slot) => {
                    if slot.timer.ctr == 0 {
                        // disarmed earlier; lazy unlink happens now
                        slot.timer.linked = false;
                        continue;
                    }
                    slot.timer.ctr -= 1;
                    if slot.timer.ctr != 0 {
                        kept.push(prio);
                        continue;
                    }
                    // expired: auto-disarm and unlink
                    slot.timer.linked = false;
                    slot.timer.signal = WakeSignal::Cleared;
                    true
                }
            };
            if fired {
                log::trace!("timer expired for xthread {prio}");
                shared.unblock(&mut st, prio);
            }
        }
        st.timer_lists[rate.0 as usize].extend(kept);
    }

    /// Raises the scheduler lock ceiling, preventing preemption by threads
    /// at or below it. Returns the previous status for [`sched_unlock`].
    ///
    /// [`sched_unlock`]: Kernel::sched_unlock
    pub fn sched_lock(&self, ceiling: u8) -> SchedStatus {
        let mut st = self.shared.state.lock();
        if ceiling > st.lock_ceiling {
            let previous = st.lock_ceiling;
            st.lock_ceiling = ceiling;
            if st.lock_holder.is_none() {
                st.lock_holder = current_priority();
            }
            log::trace!("scheduler locked at ceiling {ceiling}");
            SchedStatus::Locked(previous)
        } else {
            SchedStatus::Unlocked
        }
    }

    /// Restores the scheduler lock to its previous status. Wakeups that
    /// the ceiling deferred may preempt the caller here.
    pub fn sched_unlock(&self, status: SchedStatus) {
        if let SchedStatus::Locked(previous) = status {
            let mut st = self.shared.state.lock();
            if st.lock_ceiling > previous {
                log::trace!("scheduler unlocked to ceiling {previous}");
                st.lock_ceiling = previous;
                if previous == 0 {
                    st.lock_holder = None;
                }
                self.shared.schedule(&mut st);
            }
        }
    }
}
