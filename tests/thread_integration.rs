//! End-to-end scenarios exercising blocking threads, posting, timeouts and
//! scheduler locking.
//!
//! The tests drive the clock and the scheduler explicitly: `tick` advances
//! time, `run_to_idle` runs every ready thread until the system blocks, so
//! each scenario is fully deterministic without sleeps.

use std::sync::Arc;

use parking_lot::Mutex;
use xkern::{
    DynEvent, EventTarget, Kernel, Margin, Priority, Signal, TickRate, Timeout, XThread,
    XThreadHandler,
};

const PING: Signal = Signal(4);
const STOP: Signal = Signal(5);

type Recorder = Arc<Mutex<Vec<String>>>;

fn recorder() -> Recorder {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(rec: &Recorder, entry: impl Into<String>) {
    rec.lock().push(entry.into());
}

fn taken(rec: &Recorder) -> Vec<String> {
    rec.lock().clone()
}

fn xthread(handler: XThreadHandler) -> XThread {
    XThread::new(handler, TickRate(0))
}

const STACK: usize = 64 * 1024;

#[test]
fn delay_elapses_after_exact_tick_count() {
    let kernel = Kernel::new();
    let rec = recorder();

    let rec2 = Arc::clone(&rec);
    kernel.start(
        xthread(Box::new(move |ctx| {
            record(&rec2, "start");
            let elapsed = ctx.delay(3);
            record(&rec2, format!("done:{elapsed}"));
        })),
        Priority(3),
        1,
        STACK,
    );

    kernel.run_to_idle();
    kernel.tick(TickRate(0));
    kernel.tick(TickRate(0));
    kernel.run_to_idle();
    // two ticks are not enough
    assert_eq!(taken(&rec), vec!["start"]);

    kernel.tick(TickRate(0));
    kernel.run_to_idle();
    assert_eq!(taken(&rec), vec!["start", "done:true"]);
}

#[test]
fn receive_timeout_yields_none() {
    let kernel = Kernel::new();
    let rec = recorder();

    let rec2 = Arc::clone(&rec);
    kernel.start(
        xthread(Box::new(move |ctx| {
            let got = ctx.receive(Timeout::Ticks(5));
            record(&rec2, format!("got:{}", got.is_some()));
        })),
        Priority(4),
        2,
        STACK,
    );

    kernel.run_to_idle();
    for _ in 0..4 {
        kernel.tick(TickRate(0));
    }
    kernel.run_to_idle();
    assert!(taken(&rec).is_empty());

    kernel.tick(TickRate(0));
    kernel.run_to_idle();
    assert_eq!(taken(&rec), vec!["got:false"]);
}

#[test]
fn post_wakes_receiver_and_disarms_its_timeout() {
    let kernel = Kernel::new();
    let rec = recorder();

    let rec2 = Arc::clone(&rec);
    let handle = kernel.start(
        xthread(Box::new(move |ctx| {
            let event = ctx.receive(Timeout::Ticks(100)).expect("posted event");
            let value = *event.downcast_payload::<u32>().expect("u32 payload");
            record(&rec2, format!("{}:{value}", event.signal()));
        })),
        Priority(4),
        2,
        STACK,
    );

    kernel.run_to_idle();
    // blocked on the queue, not on a delay
    assert!(!handle.delay_cancel());

    assert!(handle.post(DynEvent::with_arc(PING, Arc::new(7u32)), Margin::None));
    kernel.run_to_idle();
    assert_eq!(taken(&rec), vec!["SIG(0x0004):7"]);

    // the procedure returned; the dead timeout link must not fire anything
    assert_eq!(handle.queue_free(), None);
    for _ in 0..100 {
        kernel.tick(TickRate(0));
    }
    kernel.run_to_idle();
}

#[test]
fn events_are_delivered_in_fifo_order() {
    let kernel = Kernel::new();
    let rec = recorder();

    let rec2 = Arc::clone(&rec);
    let handle = kernel.start(
        xthread(Box::new(move |ctx| loop {
            let event = ctx.receive(Timeout::Never).expect("no timeout armed");
            if event.signal() == STOP {
                return;
            }
            record(&rec2, event.signal().to_string());
        })),
        Priority(2),
        3,
        STACK,
    );

    kernel.run_to_idle();
    for sig in [Signal(1), Signal(2), Signal(3), STOP] {
        assert!(handle.post(DynEvent::empty_dyn(sig), Margin::None));
    }
    kernel.run_to_idle();

    assert_eq!(taken(&rec), vec!["SIG(0x0001)", "SIG(0x0002)", "SIG(0x0003)"]);
    assert_eq!(handle.queue_free(), None);
}

#[test]
fn margin_posts_degrade_to_drops_on_a_full_queue() {
    let kernel = Kernel::new();

    let handle = kernel.start(
        xthread(Box::new(|ctx| {
            ctx.receive(Timeout::Never);
            ctx.receive(Timeout::Never);
        })),
        Priority(2),
        1,
        STACK,
    );

    // ring of 1 plus the front slot: room for exactly two events
    assert_eq!(handle.queue_free(), Some(2));
    assert!(handle.post(DynEvent::empty_dyn(PING), Margin::Free(0)));
    assert!(handle.post(DynEvent::empty_dyn(PING), Margin::Free(0)));
    assert!(!handle.post(DynEvent::empty_dyn(PING), Margin::Free(0)));
    assert_eq!(handle.queue_free(), Some(0));
    assert_eq!(handle.queue_min_free(), Some(0));

    kernel.run_to_idle();
}

#[test]
#[should_panic(expected = "module 'xthread' (location 310)")]
fn guaranteed_post_to_a_full_queue_is_fatal() {
    let kernel = Kernel::new();
    let handle = kernel.start(xthread(Box::new(|_ctx| {})), Priority(2), 1, STACK);

    assert!(handle.post(DynEvent::empty_dyn(PING), Margin::None));
    assert!(handle.post(DynEvent::empty_dyn(PING), Margin::None));
    handle.post(DynEvent::empty_dyn(PING), Margin::None);
}

#[test]
#[should_panic(expected = "module 'xthread' (location 320)")]
fn posting_to_a_thread_without_a_queue_is_fatal() {
    let kernel = Kernel::new();
    let handle = kernel.start(xthread(Box::new(|_ctx| {})), Priority(2), 0, STACK);

    handle.post(DynEvent::empty_dyn(PING), Margin::Free(0));
}

#[test]
#[should_panic(expected = "module 'xthread' (location 410)")]
fn lifo_posting_is_not_supported() {
    let kernel = Kernel::new();
    let handle = kernel.start(xthread(Box::new(|_ctx| {})), Priority(2), 2, STACK);

    handle.post_lifo(DynEvent::empty_dyn(PING));
}

#[test]
fn cancelled_delay_reports_early_wakeup() {
    let kernel = Kernel::new();
    let rec = recorder();

    let rec2 = Arc::clone(&rec);
    let handle = kernel.start(
        xthread(Box::new(move |ctx| {
            let elapsed = ctx.delay(5);
            record(&rec2, format!("elapsed:{elapsed}"));
        })),
        Priority(3),
        1,
        STACK,
    );

    kernel.run_to_idle();
    assert!(handle.delay_cancel());
    // already cancelled; nothing left to cut short
    assert!(!handle.delay_cancel());

    kernel.run_to_idle();
    assert_eq!(taken(&rec), vec!["elapsed:false"]);

    // the thread returned
    assert!(!handle.delay_cancel());
}

#[test]
fn posting_from_a_low_thread_preempts_into_the_high_one() {
    let kernel = Kernel::new();
    let rec = recorder();

    let rec_hi = Arc::clone(&rec);
    let hi = kernel.start(
        xthread(Box::new(move |ctx| {
            record(&rec_hi, "hi:wait");
            ctx.receive(Timeout::Never);
            record(&rec_hi, "hi:got");
        })),
        Priority(5),
        2,
        STACK,
    );
    kernel.run_to_idle();

    let rec_lo = Arc::clone(&rec);
    kernel.start(
        xthread(Box::new(move |_ctx| {
            record(&rec_lo, "lo:pre");
            hi.post(DynEvent::empty_dyn(PING), Margin::None);
            record(&rec_lo, "lo:post");
        })),
        Priority(2),
        1,
        STACK,
    );
    kernel.run_to_idle();

    // the post hands control to the higher-priority receiver immediately
    assert_eq!(taken(&rec), vec!["hi:wait", "lo:pre", "hi:got", "lo:post"]);
}

#[test]
fn scheduler_lock_defers_preemption_until_unlock() {
    let kernel = Kernel::new();
    let rec = recorder();

    let rec_hi = Arc::clone(&rec);
    let hi = kernel.start(
        xthread(Box::new(move |ctx| {
            record(&rec_hi, "hi:wait");
            ctx.receive(Timeout::Never);
            record(&rec_hi, "hi:got");
        })),
        Priority(5),
        2,
        STACK,
    );
    kernel.run_to_idle();

    let rec_lo = Arc::clone(&rec);
    kernel.start(
        xthread(Box::new(move |ctx| {
            let status = ctx.kernel().sched_lock(10);
            record(&rec_lo, "lo:locked");
            hi.post(DynEvent::empty_dyn(PING), Margin::None);
            record(&rec_lo, "lo:posted");
            ctx.kernel().sched_unlock(status);
            record(&rec_lo, "lo:unlocked");
        })),
        Priority(2),
        1,
        STACK,
    );
    kernel.run_to_idle();

    assert_eq!(
        taken(&rec),
        vec!["hi:wait", "lo:locked", "lo:posted", "hi:got", "lo:unlocked"]
    );
}

#[test]
fn posts_from_two_producers_arrive_in_global_order() {
    const A1: Signal = Signal(10);
    const A2: Signal = Signal(11);
    const B1: Signal = Signal(20);
    const B2: Signal = Signal(21);
    const GO: Signal = Signal(30);

    let kernel = Kernel::new();
    let rec = recorder();

    let rec2 = Arc::clone(&rec);
    let consumer = kernel.start(
        xthread(Box::new(move |ctx| loop {
            let event = ctx.receive(Timeout::Never).expect("no timeout armed");
            if event.signal() == STOP {
                return;
            }
            record(&rec2, event.signal().to_string());
        })),
        Priority(2),
        4,
        STACK,
    );
    kernel.run_to_idle();

    // producer A posts, then parks until producer B waves it on
    let to_a = consumer.clone();
    let a = kernel.start(
        xthread(Box::new(move |ctx| {
            to_a.post(DynEvent::empty_dyn(A1), Margin::None);
            ctx.receive(Timeout::Never);
            to_a.post(DynEvent::empty_dyn(A2), Margin::None);
        })),
        Priority(4),
        1,
        STACK,
    );
    kernel.run_to_idle();

    let to_b = consumer.clone();
    kernel.start(
        xthread(Box::new(move |_ctx| {
            to_b.post(DynEvent::empty_dyn(B1), Margin::None);
            // waking A preempts here, so A2 lands before B2
            a.post(DynEvent::empty_dyn(GO), Margin::None);
            to_b.post(DynEvent::empty_dyn(B2), Margin::None);
            to_b.post(DynEvent::empty_dyn(STOP), Margin::None);
        })),
        Priority(3),
        1,
        STACK,
    );
    kernel.run_to_idle();

    assert_eq!(
        taken(&rec),
        vec!["SIG(0x000a)", "SIG(0x0014)", "SIG(0x000b)", "SIG(0x0015)"]
    );
    assert_eq!(consumer.queue_free(), None);
}

#[test]
#[should_panic(expected = "module 'xthread' (location 500)")]
fn receiving_while_holding_the_scheduler_lock_is_fatal() {
    let kernel = Kernel::new();
    kernel.start(
        xthread(Box::new(|ctx| {
            let _status = ctx.kernel().sched_lock(10);
            ctx.receive(Timeout::Never);
        })),
        Priority(3),
        1,
        STACK,
    );
    kernel.run_to_idle();
}

#[test]
#[should_panic(expected = "module 'xthread' (location 800)")]
fn delaying_while_holding_the_scheduler_lock_is_fatal() {
    let kernel = Kernel::new();
    kernel.start(
        xthread(Box::new(|ctx| {
            let _status = ctx.kernel().sched_lock(10);
            ctx.delay(5);
        })),
        Priority(3),
        1,
        STACK,
    );
    kernel.run_to_idle();
}

#[test]
fn post_to_a_returned_thread_is_dropped() {
    let kernel = Kernel::new();
    let handle = kernel.start(xthread(Box::new(|_ctx| {})), Priority(2), 2, STACK);

    kernel.run_to_idle();
    assert!(!handle.post(DynEvent::empty_dyn(PING), Margin::None));
    assert_eq!(handle.queue_min_free(), None);
}

#[test]
fn independent_tick_rates_do_not_interfere() {
    let kernel = Kernel::new();
    let rec = recorder();

    let rec2 = Arc::clone(&rec);
    kernel.start(
        XThread::new(
            Box::new(move |ctx| {
                let elapsed = ctx.delay(2);
                record(&rec2, format!("slow:{elapsed}"));
            }),
            TickRate(1),
        ),
        Priority(3),
        1,
        STACK,
    );

    kernel.run_to_idle();
    // the thread's timer counts rate 1; rate 0 ticks must not advance it
    for _ in 0..10 {
        kernel.tick(TickRate(0));
    }
    kernel.run_to_idle();
    assert!(taken(&rec).is_empty());

    kernel.tick(TickRate(1));
    kernel.tick(TickRate(1));
    kernel.run_to_idle();
    assert_eq!(taken(&rec), vec!["slow:true"]);
}
