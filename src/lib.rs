//! # xkern
//!
//! A priority-preemptive kernel core for *extended* threads: ordinary
//! blocking procedures that own a bounded private event queue and a
//! single-shot timeout, scheduled strictly by unique priority.
//!
//! ## Capabilities
//!
//! - Up to 63 extended threads with unique priorities; the highest ready
//!   priority always runs.
//! - Per-thread bounded event queue with a front-slot fast path and a
//!   margin policy on every post: guaranteed delivery or best-effort with
//!   a required number of free slots.
//! - Blocking [`receive`] with an optional timeout and blocking [`delay`]
//!   that can be cancelled from outside, both backed by one per-thread
//!   timer linked into per-tick-rate expiry lists.
//! - A scheduler lock with a priority ceiling for short non-preemptible
//!   sections.
//! - Explicit clock and scheduling control for deterministic hosting:
//!   [`Kernel::tick`] advances a tick rate, [`Kernel::run_to_idle`] runs
//!   ready threads until everything blocks.
//!
//! Contract violations (posting to a queue-less thread, overrunning a
//! guaranteed-delivery queue, blocking while holding the scheduler lock)
//! are fatal by design and panic with a module/location code.
//!
//! ## Example
//!
//! ```
//! use xkern::{DynEvent, Kernel, Margin, Priority, Signal, TickRate, Timeout, XThread};
//!
//! const PING: Signal = Signal(4);
//!
//! let kernel = Kernel::new();
//! let worker = kernel.start(
//!     XThread::new(
//!         Box::new(|ctx| {
//!             while let Some(event) = ctx.receive(Timeout::Ticks(10)) {
//!                 assert_eq!(event.signal(), PING);
//!             }
//!         }),
//!         TickRate(0),
//!     ),
//!     Priority(5),
//!     4,
//!     64 * 1024,
//! );
//!
//! assert!(worker.post(DynEvent::empty_dyn(PING), Margin::None));
//! kernel.run_to_idle();
//! for _ in 0..10 {
//!     kernel.tick(TickRate(0));
//! }
//! kernel.run_to_idle();
//! ```
//!
//! [`receive`]: XThreadContext::receive
//! [`delay`]: XThreadContext::delay

mod event;
mod fault;
mod kernel;
mod queue;
mod sched;
mod thread;
mod timer;

pub use event::{DynEvent, DynPayload, Event, Signal};
pub use fault::ContractViolation;
pub use kernel::{Kernel, KernelConfig};
pub use sched::{Priority, SchedStatus, MAX_PRIORITY};
pub use thread::{EventTarget, Margin, ThreadHandle, XThread, XThreadContext, XThreadHandler};
pub use timer::{TickRate, Timeout, MAX_TICK_RATES};
