//! Per-thread bounded event queue.
//!
//! The queue keeps the next event to deliver in a separate front slot and
//! the rest in a fixed ring buffer with down-counting cursors. Delivering
//! into the front slot when the queue is empty avoids a ring-buffer write
//! on the common fast path. Total capacity is the ring length plus one
//! (the front slot); a ring length of zero means the owning thread has no
//! built-in queue at all.
//!
//! All mutation happens under the kernel critical section; the queue itself
//! carries no locking.

use crate::event::DynEvent;
use crate::fault::{kfault, krequire};

const MODULE: &str = "equeue";

/// Bounded FIFO ring buffer owned by exactly one extended thread.
pub struct EventQueue {
    /// Event pending delivery; the queue is logically empty iff `None`.
    front_evt: Option<DynEvent>,
    ring: Box<[Option<DynEvent>]>,
    /// Insertion cursor, counting down with wraparound.
    head: usize,
    /// Removal cursor, counting down with wraparound.
    tail: usize,
    n_free: usize,
    /// Minimum free count ever seen, for sizing diagnostics.
    n_min: usize,
}

impl EventQueue {
    /// Creates a queue with the given ring length (0 = no queue).
    pub(crate) fn new(ring_len: usize) -> Self {
        let n_free = if ring_len == 0 { 0 } else { ring_len + 1 };
        Self {
            front_evt: None,
            ring: (0..ring_len).map(|_| None).collect(),
            head: 0,
            tail: 0,
            n_free,
            n_min: n_free,
        }
    }

    /// Ring length; total capacity is one more than this when nonzero.
    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    /// Current number of free slots.
    pub fn free(&self) -> usize {
        self.n_free
    }

    /// Minimum free count ever observed.
    pub fn min_free(&self) -> usize {
        self.n_min
    }

    /// Whether the thread has a built-in queue at all.
    pub(crate) fn is_available(&self) -> bool {
        !self.ring.is_empty()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.front_evt.is_none()
    }

    /// Inserts an event in FIFO order, consuming one free slot.
    ///
    /// The caller has already checked the margin against [`free`]. Returns
    /// true when the event landed directly in the front slot, which is the
    /// case that can wake a blocked receiver.
    ///
    /// [`free`]: EventQueue::free
    pub(crate) fn insert_fifo(&mut self, event: DynEvent) -> bool {
        debug_assert!(self.n_free > 0, "insert into full queue");
        self.n_free -= 1;
        if self.n_min > self.n_free {
            self.n_min = self.n_free;
        }

        if self.front_evt.is_none() {
            self.front_evt = Some(event);
            true
        } else {
            self.ring[self.head] = Some(event);
            if self.head == 0 {
                self.head = self.ring.len();
            }
            self.head -= 1;
            false
        }
    }

    /// Removes the front event and promotes the next ring entry, if any.
    pub(crate) fn get(&mut self) -> Option<DynEvent> {
        let event = self.front_evt.take()?;
        self.n_free += 1;

        if self.n_free <= self.ring.len() {
            // the ring still holds events; promote from the tail
            self.front_evt = match self.ring[self.tail].take() {
                Some(event) => Some(event),
                // free-count accounting disagrees with the ring contents
                None => kfault!(MODULE, 530),
            };
            if self.tail == 0 {
                self.tail = self.ring.len();
            }
            self.tail -= 1;
        } else {
            // queue drained: every slot plus the front one must be free
            krequire!(MODULE, 520, self.n_free == self.ring.len() + 1);
        }

        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DynEvent, Signal};

    fn evt(sig: u16) -> DynEvent {
        DynEvent::empty_dyn(Signal(sig))
    }

    #[test]
    fn first_event_lands_in_front_slot() {
        let mut queue = EventQueue::new(2);
        assert!(queue.is_empty());
        assert_eq!(queue.free(), 3);

        assert!(queue.insert_fifo(evt(1)));
        assert!(!queue.is_empty());
        assert_eq!(queue.free(), 2);
    }

    #[test]
    fn capacity_one_holds_front_plus_one_ring_entry() {
        let mut queue = EventQueue::new(1);
        assert_eq!(queue.free(), 2);

        assert!(queue.insert_fifo(evt(1)));
        assert!(!queue.insert_fifo(evt(2)));
        assert_eq!(queue.free(), 0);

        assert_eq!(queue.get().map(|e| e.signal()), Some(Signal(1)));
        assert_eq!(queue.get().map(|e| e.signal()), Some(Signal(2)));
        assert_eq!(queue.get().map(|e| e.signal()), None);
        assert_eq!(queue.free(), 2);
    }

    #[test]
    fn fifo_order_survives_wraparound() {
        let mut queue = EventQueue::new(3);
        let mut expected = Vec::new();
        let mut next = 0u16;

        // interleave inserts and removals to push the cursors around the ring
        for round in 0..5 {
            for _ in 0..(2 + round % 2) {
                queue.insert_fifo(evt(next));
                expected.push(Signal(next));
                next += 1;
            }
            for _ in 0..2 {
                let got = queue.get().expect("queue should not be empty");
                assert_eq!(got.signal(), expected.remove(0));
            }
        }
        while let Some(got) = queue.get() {
            assert_eq!(got.signal(), expected.remove(0));
        }
        assert!(expected.is_empty());
    }

    #[test]
    fn watermark_tracks_minimum_free() {
        let mut queue = EventQueue::new(2);
        assert_eq!(queue.min_free(), 3);

        queue.insert_fifo(evt(1));
        queue.insert_fifo(evt(2));
        assert_eq!(queue.min_free(), 1);

        queue.get();
        queue.get();
        assert_eq!(queue.free(), 3);
        // watermark does not recover
        assert_eq!(queue.min_free(), 1);
    }

    #[test]
    #[should_panic(expected = "module 'equeue' (location 530)")]
    fn accounting_mismatch_with_the_ring_is_fatal() {
        let mut queue = EventQueue::new(2);
        queue.insert_fifo(evt(1));
        // fake a second insertion that never wrote its ring entry
        queue.n_free -= 1;
        queue.get();
    }

    #[test]
    fn zero_length_queue_is_unavailable() {
        let queue = EventQueue::new(0);
        assert!(!queue.is_available());
        assert_eq!(queue.free(), 0);
    }
}
