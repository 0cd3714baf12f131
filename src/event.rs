//! Event and signal primitives.
//!
//! Events are lightweight messages identified by an integral signal with an
//! optional payload. Delivery to a thread's queue transfers one strong
//! reference to the queue; dequeueing transfers it to the consumer, and
//! dropping the last handle releases the event. This replaces the manual
//! reference counting that a pool-backed allocator would do.

use core::fmt;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

/// Identifier for an event signal.
///
/// Signals are globally unique numeric identifiers; a 16-bit range keeps
/// them portable across targets.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signal(pub u16);

impl From<u16> for Signal {
    #[inline]
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG({:#06x})", self.0)
    }
}

/// Concrete event type with a strongly typed payload.
#[derive(Debug)]
pub struct Event<T = ()> {
    pub signal: Signal,
    pub payload: T,
}

impl<T> Event<T> {
    pub fn new(signal: Signal, payload: T) -> Self {
        Self { signal, payload }
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }
}

impl Event<()> {
    pub fn empty(signal: Signal) -> Self {
        Self::new(signal, ())
    }
}

impl<T: Clone> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal,
            payload: self.payload.clone(),
        }
    }
}

/// Type-erased, shared event payload.
pub type DynPayload = Arc<dyn Any + Send + Sync>;

/// Event envelope delivered through thread queues.
pub type DynEvent = Event<DynPayload>;

impl Event<DynPayload> {
    pub fn with_arc(signal: Signal, payload: DynPayload) -> Self {
        Self::new(signal, payload)
    }

    pub fn empty_dyn(signal: Signal) -> Self {
        let payload: DynPayload = Arc::new(()) as DynPayload;
        Self::with_arc(signal, payload)
    }

    /// Attempts to view the payload as a concrete type.
    pub fn downcast_payload<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}
