//! Timer engine
//!
//! Per-CPU, per-clock ordered timer queues. A timer is idle, queued on exactly
//! one base, or firing (transient). Queue entries carry an enqueue token so a
//! concurrent stop/move/restart invalidates an already-popped entry instead of
//! racing the expiry path; handlers therefore run with no queue lock held.

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::scheduler::thread::ThreadId;
use crate::time::clock::{Clock, ClockId};
use crate::time::{Duration, Timestamp};
use crate::{bounded_name, Core, Name};

/// Stable timer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Timer life cycle: `Idle -> Queued -> Firing -> (Idle | Queued)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Not queued anywhere
    Idle,
    /// Queued on exactly one per-CPU/per-clock base
    Queued,
    /// Handler in flight; re-queued immediately if periodic
    Firing,
}

/// Free-form expiry callback
pub type TimerCallback = Box<dyn FnMut(&Core, TimerId) + Send>;

/// What to run when the timer expires.
///
/// The scheduler's own uses are closed variants; `Callback` is the hook for
/// embedders. Handlers must not block: wake-style handlers mark the thread
/// ready and request a reschedule, they never run the woken thread inline.
pub enum TimerHandler {
    /// Unblock a sleeping thread (wait timeout / sleep deadline)
    WakeThread(ThreadId),
    /// Round-robin quantum tick for the owning CPU
    Roundrobin,
    /// Oob watchdog for the owning CPU's current thread
    Watchdog,
    /// Embedder-supplied callback
    Callback(Option<TimerCallback>),
}

impl TimerHandler {
    /// Wrap a plain callback
    pub fn callback(cb: TimerCallback) -> Self {
        Self::Callback(Some(cb))
    }
}

impl fmt::Debug for TimerHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WakeThread(tid) => write!(f, "WakeThread({})", tid.0),
            Self::Roundrobin => write!(f, "Roundrobin"),
            Self::Watchdog => write!(f, "Watchdog"),
            Self::Callback(_) => write!(f, "Callback"),
        }
    }
}

/// Timer control block
pub(crate) struct Timer {
    pub(crate) id: TimerId,
    pub(crate) name: Name,
    pub(crate) state: TimerState,
    pub(crate) clock: ClockId,
    pub(crate) cpu: usize,
    pub(crate) expiry: Timestamp,
    pub(crate) period: Duration,
    /// Bumped on every arm/disarm; queue entries with a stale token are dead
    pub(crate) token: u64,
    /// Sequence of the current queue entry (FIFO tie-break among equal expiries)
    pub(crate) key_seq: u64,
    pub(crate) handler: TimerHandler,
    pub(crate) fire_count: u64,
}

impl Timer {
    fn current_key(&self) -> TimerKey {
        TimerKey {
            expiry: self.expiry,
            seq: self.key_seq,
            timer: self.id.0,
            token: self.token,
        }
    }

    fn restore_callback(&mut self, cb: TimerCallback) {
        if let TimerHandler::Callback(slot) = &mut self.handler {
            *slot = Some(cb);
        }
    }
}

/// Ordered-queue entry: (expiry, seq) gives non-decreasing expiry processing
/// with FIFO among equal expiries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    pub(crate) expiry: Timestamp,
    pub(crate) seq: u64,
    pub(crate) timer: u64,
    pub(crate) token: u64,
}

/// One per-CPU, per-clock ordered timer queue
pub(crate) struct TimerBase {
    pub(crate) q: BTreeSet<TimerKey>,
    seq: u64,
}

impl TimerBase {
    pub(crate) fn new() -> Self {
        Self {
            q: BTreeSet::new(),
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Arena of timer control blocks, referenced by stable ids
pub(crate) struct TimerArena {
    map: Mutex<HashMap<u64, Arc<Mutex<Timer>>>>,
    next: AtomicU64,
}

impl TimerArena {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    fn alloc(&self, name: Name, clock: ClockId, handler: TimerHandler) -> TimerId {
        let id = TimerId(self.next.fetch_add(1, Ordering::Relaxed));
        let timer = Timer {
            id,
            name,
            state: TimerState::Idle,
            clock,
            cpu: 0,
            expiry: Timestamp::ZERO,
            period: Duration::ZERO,
            token: 0,
            key_seq: 0,
            handler,
            fire_count: 0,
        };
        self.map.lock().insert(id.0, Arc::new(Mutex::new(timer)));
        id
    }

    pub(crate) fn get(&self, id: TimerId) -> Option<Arc<Mutex<Timer>>> {
        self.map.lock().get(&id.0).cloned()
    }

    fn remove(&self, id: TimerId) -> Option<Arc<Mutex<Timer>>> {
        self.map.lock().remove(&id.0)
    }
}

/// Extracted handler work, dispatched after all timer locks are dropped
enum Fired {
    Wake(ThreadId),
    Roundrobin,
    Watchdog,
    Callback(Option<TimerCallback>),
}

impl Core {
    /// Allocate a timer with the given expiry handler (initially idle, bound
    /// to the built-in monotonic clock until started elsewhere)
    pub fn create_timer(&self, name: &str, handler: TimerHandler) -> TimerId {
        let id = self.timers.alloc(bounded_name(name), self.monotonic, handler);
        log::trace!("timer {}: created ({})", id.0, name);
        id
    }

    /// Stop and destroy a timer
    pub fn destroy_timer(&self, id: TimerId) -> Result<()> {
        self.timer_stop(id)?;
        self.timers
            .remove(id)
            .map(|_| ())
            .ok_or(Error::NoSuchTimer { id: id.0 })
    }

    /// Arm `timer` on `clock`'s base for `cpu`.
    ///
    /// A change of CPU or clock is a move: the previous queueing is removed
    /// first, so the timer is never visible on two queues. `period` of zero
    /// makes it one-shot.
    pub fn timer_start(
        &self,
        id: TimerId,
        clock_id: ClockId,
        cpu: usize,
        expiry: Timestamp,
        period: Duration,
    ) -> Result<()> {
        self.check_cpu(cpu)?;
        let clock = self.clock(clock_id)?;
        let timer = self.timers.get(id).ok_or(Error::NoSuchTimer { id: id.0 })?;

        let mut t = timer.lock();
        let old_slot = self.unqueue_locked(&mut t);
        t.token += 1;
        t.clock = clock_id;
        t.cpu = cpu;
        t.expiry = expiry;
        t.period = period;
        {
            let mut base = clock.base(cpu).lock();
            let seq = base.next_seq();
            t.key_seq = seq;
            base.q.insert(TimerKey {
                expiry,
                seq,
                timer: id.0,
                token: t.token,
            });
        }
        t.state = TimerState::Queued;
        log::trace!(
            "timer {}: armed on cpu {} for {}ns (period {}ns)",
            id.0,
            cpu,
            expiry.as_ns(),
            period.as_ns()
        );
        drop(t);
        if let Some((old_clock, old_cpu)) = old_slot {
            if (old_clock, old_cpu) != (clock_id, cpu) {
                if let Ok(old) = self.clock(old_clock) {
                    self.reprogram_shot(&old, old_cpu);
                }
            }
        }
        self.reprogram_shot(&clock, cpu);
        Ok(())
    }

    /// Disarm a timer; a no-op (not an error) if it is already idle
    pub fn timer_stop(&self, id: TimerId) -> Result<()> {
        let timer = self.timers.get(id).ok_or(Error::NoSuchTimer { id: id.0 })?;
        let mut t = timer.lock();
        if t.state == TimerState::Idle {
            return Ok(());
        }
        let reprogram = (t.state == TimerState::Queued).then(|| (t.clock, t.cpu));
        self.unqueue_locked(&mut t);
        t.state = TimerState::Idle;
        t.token += 1;
        drop(t);
        if let Some((clock_id, cpu)) = reprogram {
            if let Ok(clock) = self.clock(clock_id) {
                self.reprogram_shot(&clock, cpu);
            }
        }
        Ok(())
    }

    /// Transfer a timer to another CPU's queue (ownership transfer, not a
    /// copy); used when the owning thread migrates.
    pub fn timer_move(&self, id: TimerId, new_cpu: usize) -> Result<()> {
        self.check_cpu(new_cpu)?;
        let timer = self.timers.get(id).ok_or(Error::NoSuchTimer { id: id.0 })?;
        let mut t = timer.lock();
        if t.cpu == new_cpu {
            return Ok(());
        }
        match t.state {
            // The requeue/arm paths read `cpu`, nothing is queued to move.
            TimerState::Idle | TimerState::Firing => {
                t.cpu = new_cpu;
                Ok(())
            }
            TimerState::Queued => {
                let clock = self.clock(t.clock)?;
                let old_cpu = t.cpu;
                {
                    let mut base = clock.base(old_cpu).lock();
                    let key = t.current_key();
                    base.q.remove(&key);
                }
                t.cpu = new_cpu;
                t.token += 1;
                {
                    let mut base = clock.base(new_cpu).lock();
                    let seq = base.next_seq();
                    t.key_seq = seq;
                    base.q.insert(TimerKey {
                        expiry: t.expiry,
                        seq,
                        timer: id.0,
                        token: t.token,
                    });
                }
                log::trace!("timer {}: moved cpu {} -> {}", id.0, old_cpu, new_cpu);
                drop(t);
                self.reprogram_shot(&clock, old_cpu);
                self.reprogram_shot(&clock, new_cpu);
                Ok(())
            }
        }
    }

    /// Pop and fire every due timer on `clock`'s base for `cpu`.
    ///
    /// Entries fire in non-decreasing expiry order, FIFO among equal
    /// expiries. Periodic timers re-queue at the smallest `expiry + k·period`
    /// in the future — one fire per pass, never a burst for missed periods.
    /// Returns the number of timers fired.
    pub fn process_expiries(&self, clock_id: ClockId, cpu: usize) -> Result<u32> {
        self.check_cpu(cpu)?;
        let clock = self.clock(clock_id)?;
        let now = clock.now();
        let mut fired = 0u32;

        loop {
            let key = {
                let mut base = clock.base(cpu).lock();
                match base.q.first().copied() {
                    Some(k) if k.expiry <= now => {
                        base.q.remove(&k);
                        Some(k)
                    }
                    _ => None,
                }
            };
            let Some(key) = key else { break };
            let Some(timer) = self.timers.get(TimerId(key.timer)) else {
                continue;
            };

            let action = {
                let mut t = timer.lock();
                if t.token != key.token || t.state != TimerState::Queued {
                    // Stale entry: the timer was stopped, moved or re-armed
                    // after this entry was queued.
                    continue;
                }
                t.state = TimerState::Firing;
                t.fire_count += 1;
                log::trace!("timer {}: fired at {}ns", key.timer, now.as_ns());
                match &mut t.handler {
                    TimerHandler::WakeThread(tid) => Fired::Wake(*tid),
                    TimerHandler::Roundrobin => Fired::Roundrobin,
                    TimerHandler::Watchdog => Fired::Watchdog,
                    TimerHandler::Callback(slot) => Fired::Callback(slot.take()),
                }
            };

            // Handler runs with no queue or timer lock held.
            match action {
                Fired::Wake(tid) => {
                    let _ = self.timed_unblock(tid, cpu);
                }
                Fired::Roundrobin => self.rr_tick(cpu),
                Fired::Watchdog => self.watchdog_fire(cpu),
                Fired::Callback(Some(mut cb)) => {
                    cb(self, TimerId(key.timer));
                    timer.lock().restore_callback(cb);
                }
                Fired::Callback(None) => {}
            }

            {
                let mut t = timer.lock();
                // A handler may have stopped or re-armed the timer; only a
                // still-Firing timer owns its requeue.
                if t.state == TimerState::Firing {
                    if t.period.is_zero() {
                        t.state = TimerState::Idle;
                        t.token += 1;
                    } else {
                        let mut expiry = t.expiry;
                        while expiry <= now {
                            expiry = expiry + t.period;
                        }
                        t.expiry = expiry;
                        t.token += 1;
                        let requeue_cpu = t.cpu;
                        let mut base = clock.base(requeue_cpu).lock();
                        let seq = base.next_seq();
                        t.key_seq = seq;
                        base.q.insert(TimerKey {
                            expiry,
                            seq,
                            timer: key.timer,
                            token: t.token,
                        });
                        t.state = TimerState::Queued;
                    }
                }
            }
            fired += 1;
        }

        self.reprogram_shot(&clock, cpu);
        Ok(fired)
    }

    /// Current state of a timer
    pub fn timer_state(&self, id: TimerId) -> Result<TimerState> {
        let timer = self.timers.get(id).ok_or(Error::NoSuchTimer { id: id.0 })?;
        let t = timer.lock();
        Ok(t.state)
    }

    /// Number of times the timer has fired
    pub fn timer_fire_count(&self, id: TimerId) -> Result<u64> {
        let timer = self.timers.get(id).ok_or(Error::NoSuchTimer { id: id.0 })?;
        let t = timer.lock();
        Ok(t.fire_count)
    }

    /// Current absolute deadline of the timer (meaningful while queued)
    pub fn timer_deadline(&self, id: TimerId) -> Result<Timestamp> {
        let timer = self.timers.get(id).ok_or(Error::NoSuchTimer { id: id.0 })?;
        let t = timer.lock();
        Ok(t.expiry)
    }

    /// Name the timer was created with
    pub fn timer_name(&self, id: TimerId) -> Result<Name> {
        let timer = self.timers.get(id).ok_or(Error::NoSuchTimer { id: id.0 })?;
        let t = timer.lock();
        Ok(t.name.clone())
    }

    /// Remove the timer's current queue entry, if any (timer lock held);
    /// returns the (clock, cpu) slot it was removed from.
    fn unqueue_locked(&self, t: &mut Timer) -> Option<(ClockId, usize)> {
        if t.state != TimerState::Queued {
            return None;
        }
        if let Ok(clock) = self.clock(t.clock) {
            let key = t.current_key();
            clock.base(t.cpu).lock().q.remove(&key);
        }
        Some((t.clock, t.cpu))
    }

    /// Reprogram the hardware next-deadline event for one base
    fn reprogram_shot(&self, clock: &Clock, cpu: usize) {
        let head = clock.base(cpu).lock().q.first().copied();
        match head {
            Some(k) => self.platform.program_shot(cpu, k.expiry),
            None => self.platform.stop_shot(cpu),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    fn counting_timer(core: &Core, log: &Arc<Mutex<Vec<u64>>>, name: &str) -> TimerId {
        let log = log.clone();
        core.create_timer(
            name,
            TimerHandler::callback(Box::new(move |_core, id| {
                log.lock().push(id.0);
            })),
        )
    }

    #[test]
    fn test_one_shot_fires_once_then_idle() {
        let core = Core::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = counting_timer(&core, &log, "oneshot");
        core.timer_start(
            id,
            core.monotonic(),
            0,
            Timestamp::from_ns(100),
            Duration::ZERO,
        )
        .unwrap();

        core.advance_monotonic(Duration::from_ns(150));
        assert_eq!(core.process_expiries(core.monotonic(), 0).unwrap(), 1);
        assert_eq!(log.lock().len(), 1);
        assert_eq!(core.timer_state(id).unwrap(), TimerState::Idle);

        // Nothing left to fire.
        core.advance_monotonic(Duration::from_ns(1000));
        assert_eq!(core.process_expiries(core.monotonic(), 0).unwrap(), 0);
        assert_eq!(core.timer_fire_count(id).unwrap(), 1);
    }

    #[test]
    fn test_stop_is_noop_when_idle() {
        let core = Core::new(1);
        let id = core.create_timer("idle", TimerHandler::callback(Box::new(|_, _| {})));
        assert!(core.timer_stop(id).is_ok());
        assert!(core.timer_stop(id).is_ok());
    }

    #[test]
    fn test_equal_expiries_fire_in_insertion_order() {
        let core = Core::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = counting_timer(&core, &log, "a");
        let b = counting_timer(&core, &log, "b");
        let c = counting_timer(&core, &log, "c");
        let mono = core.monotonic();
        let at = Timestamp::from_ns(50);
        core.timer_start(b, mono, 0, at, Duration::ZERO).unwrap();
        core.timer_start(a, mono, 0, at, Duration::ZERO).unwrap();
        core.timer_start(c, mono, 0, at, Duration::ZERO).unwrap();

        core.advance_monotonic(Duration::from_ns(60));
        assert_eq!(core.process_expiries(mono, 0).unwrap(), 3);
        assert_eq!(*log.lock(), alloc::vec![b.0, a.0, c.0]);
    }

    #[test]
    fn test_periodic_catch_up_is_not_a_burst() {
        let core = Core::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = counting_timer(&core, &log, "periodic");
        let mono = core.monotonic();
        let period = Duration::from_ms(1);
        core.timer_start(id, mono, 0, Timestamp::from_ns(1_000_000), period)
            .unwrap();

        // Five periods go by unprocessed.
        core.advance_monotonic(Duration::from_ms(5));
        assert_eq!(core.process_expiries(mono, 0).unwrap(), 1);
        assert_eq!(log.lock().len(), 1);

        // Next deadline is the smallest multiple of the period in the future.
        let deadline = core.timer_deadline(id).unwrap();
        assert_eq!(deadline.as_ms(), 6);
        assert_eq!(core.timer_state(id).unwrap(), TimerState::Queued);
    }

    #[test]
    fn test_move_never_on_two_queues() {
        let core = Core::new(2);
        let id = core.create_timer("mover", TimerHandler::callback(Box::new(|_, _| {})));
        let mono = core.monotonic();
        core.timer_start(id, mono, 0, Timestamp::from_ns(500), Duration::ZERO)
            .unwrap();
        core.timer_move(id, 1).unwrap();

        // Old CPU's queue is empty, the timer fires on the new CPU only.
        core.advance_monotonic(Duration::from_ns(600));
        assert_eq!(core.process_expiries(mono, 0).unwrap(), 0);
        assert_eq!(core.process_expiries(mono, 1).unwrap(), 1);
        assert_eq!(core.timer_state(id).unwrap(), TimerState::Idle);
    }

    #[test]
    fn test_unregister_busy_clock() {
        let core = Core::new(1);
        let driver = Arc::new(crate::time::ManualClock::new());
        let clock = core.register_clock("dev", driver).unwrap();
        let id = core.create_timer("t", TimerHandler::callback(Box::new(|_, _| {})));
        core.timer_start(id, clock, 0, Timestamp::from_ns(10), Duration::ZERO)
            .unwrap();
        assert_eq!(core.unregister_clock(clock).unwrap_err(), Error::Busy);
        core.timer_stop(id).unwrap();
        core.unregister_clock(clock).unwrap();
    }
}
