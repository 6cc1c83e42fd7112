//! Property tests for the ordering contracts: priority/FIFO pick order, timer
//! expiry monotonicity, periodic catch-up.

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use tandem_core::{
    Core, Duration, Policy, ThreadAttr, ThreadId, TimerHandler, TimerState, Timestamp,
};

/// Pick order of a set of threads enqueued on one CPU: repeatedly read the
/// current thread and retire it.
fn drain_pick_order(core: &Core, count: usize) -> Vec<ThreadId> {
    let mut order = Vec::with_capacity(count);
    for _ in 0..count {
        let Some(tid) = core.current(0) else { break };
        order.push(tid);
        core.cancel_thread(0, tid).unwrap();
        core.join_thread(tid).unwrap();
    }
    order
}

proptest! {
    /// P1: picks come in non-increasing priority order, FIFO among equals
    /// (become-ready order).
    #[test]
    fn p1_priority_then_fifo_order(prios in prop::collection::vec(1..=99i32, 1..12)) {
        let core = Core::new(1);

        // A top-priority gate keeps the CPU while the sample threads enqueue,
        // so their become-ready order is exactly the start order.
        let gate = core
            .init_thread(ThreadAttr::new("gate", Policy::Fifo, 99))
            .unwrap();
        core.start_thread(0, gate).unwrap();

        let mut threads = Vec::new();
        for (i, &prio) in prios.iter().enumerate() {
            let tid = core
                .init_thread(ThreadAttr::new(&format!("t{}", i), Policy::Fifo, prio))
                .unwrap();
            core.start_thread(0, tid).unwrap();
            threads.push((tid, prio));
        }
        prop_assert_eq!(core.current(0), Some(gate));

        core.cancel_thread(0, gate).unwrap();
        core.join_thread(gate).unwrap();
        let order = drain_pick_order(&core, threads.len());

        prop_assert_eq!(order.len(), threads.len());
        let picked: Vec<(ThreadId, i32)> = order
            .iter()
            .map(|tid| *threads.iter().find(|(t, _)| t == tid).unwrap())
            .collect();
        for pair in picked.windows(2) {
            // Non-increasing priority.
            prop_assert!(pair[0].1 >= pair[1].1);
            // FIFO among equals: start order == id order here.
            if pair[0].1 == pair[1].1 {
                prop_assert!(pair[0].0 .0 < pair[1].0 .0);
            }
        }
    }

    /// P2: on one clock and CPU, timers fire in non-decreasing expiry order;
    /// an earlier expiry always fires before a later one.
    #[test]
    fn p2_expiry_order_is_monotonic(expiries in prop::collection::vec(1u64..10_000, 1..16)) {
        let core = Core::new(1);
        let log: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let mono = core.monotonic();

        for &ns in &expiries {
            let hook = log.clone();
            let timer = core.create_timer(
                "p2",
                TimerHandler::callback(Box::new(move |_c, _i| {
                    hook.lock().unwrap().push(ns);
                })),
            );
            core.timer_start(timer, mono, 0, Timestamp::from_ns(ns), Duration::ZERO)
                .unwrap();
        }

        core.advance_monotonic(Duration::from_ns(10_001));
        let fired = core.process_expiries(mono, 0).unwrap();
        prop_assert_eq!(fired as usize, expiries.len());

        let observed = log.lock().unwrap().clone();
        let mut sorted = expiries.clone();
        sorted.sort();
        prop_assert_eq!(observed, sorted);
    }

    /// P3: a periodic timer left unprocessed for several periods fires once,
    /// with its next deadline at the smallest `t0 + k·period` in the future.
    #[test]
    fn p3_periodic_catch_up(period_ms in 1u64..10, missed in 2u64..8) {
        let core = Core::new(1);
        let fired: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let hook = fired.clone();
        let timer = core.create_timer(
            "p3",
            TimerHandler::callback(Box::new(move |_c, _i| {
                *hook.lock().unwrap() += 1;
            })),
        );
        let mono = core.monotonic();
        let period = Duration::from_ms(period_ms);
        core.timer_start(timer, mono, 0, Timestamp::ZERO + period, period)
            .unwrap();

        // The CPU is unavailable for `missed` periods and a bit.
        let gap = Duration::from_ns(period.as_ns() * missed + period.as_ns() / 2);
        core.advance_monotonic(gap);
        core.process_expiries(mono, 0).unwrap();

        // Exactly one fire, not a burst.
        prop_assert_eq!(*fired.lock().unwrap(), 1);
        prop_assert_eq!(core.timer_state(timer).unwrap(), TimerState::Queued);

        // Next deadline is the smallest multiple of the period after `now`.
        let now = core.clock_gettime(mono).unwrap();
        let deadline = core.timer_deadline(timer).unwrap();
        prop_assert!(deadline > now);
        prop_assert!(deadline.as_ns() % period.as_ns() == 0);
        prop_assert!(deadline.as_ns() - now.as_ns() < period.as_ns());
    }
}
