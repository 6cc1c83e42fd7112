//! Thread control block and lifecycle
//!
//! The real-time thread's state: priority, status bitmask, info bits, wait
//! channel, CPU placement, accounting. Threads live in an arena referenced by
//! stable ids; every cross-reference (runqueue entry, wait-channel waiter,
//! timer target) is an id, never an owning pointer.
//!
//! Status and CPU placement stay consistent: a thread is on a ready structure
//! iff READY is set, has a wait channel iff PENDING is set, and both are only
//! mutated under the owning CPU's runqueue lock.

use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use crate::cpu::CpuMask;
use crate::error::{Error, Result};
use crate::scheduler::class::{class_of, weighted_prio, Policy, SchedClass};
use crate::scheduler::rq::RunQueue;
use crate::scheduler::stage::Stage;
use crate::stat::{StatsSnapshot, ThreadStats};
use crate::sync::wait_queue::WaitQueueId;
use crate::time::{Duration, TimerHandler, TimerId};
use crate::{bounded_name, Core, Name};

bitflags! {
    /// Thread status bits.
    ///
    /// DORMANT/DELAYED/PENDING/HELD/INBAND are the blocking bits; READY means
    /// queued on exactly one runqueue; a current thread has neither set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadState: u32 {
        /// Mapped but not started
        const DORMANT = 1 << 0;
        /// Queued on a runqueue
        const READY   = 1 << 1;
        /// Blocked on a timer (sleep or wait timeout)
        const DELAYED = 1 << 2;
        /// Blocked on a wait channel
        const PENDING = 1 << 3;
        /// Administratively suspended
        const HELD    = 1 << 4;
        /// Owned by the in-band kernel's scheduler
        const INBAND  = 1 << 5;
        /// Exited; waiting to be joined
        const ZOMBIE  = 1 << 6;
        /// Round-robin quantum rotation active
        const RRB     = 1 << 7;
    }
}

impl ThreadState {
    /// Bits that keep a thread off the ready structures
    pub const BLOCKED: Self = Self::DORMANT
        .union(Self::DELAYED)
        .union(Self::PENDING)
        .union(Self::HELD)
        .union(Self::INBAND);

    /// Eligible for the oob runqueues?
    pub fn runnable(&self) -> bool {
        !self.intersects(Self::BLOCKED.union(Self::ZOMBIE))
    }
}

bitflags! {
    /// Auxiliary condition bits, consumed by the woken/demoted thread
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadInfo: u32 {
        /// Wait timed out
        const TIMEDOUT = 1 << 0;
        /// Abnormal/flush wakeup during object teardown
        const BROKEN   = 1 << 1;
        /// Normal wakeup delivered
        const WAKEN    = 1 << 2;
        /// Forcibly demoted to the in-band stage
        const KICKED   = 1 << 3;
        /// The oob watchdog expired on this thread
        const WATCHDOG = 1 << 4;
        /// Cancellation processed
        const CANCELLED = 1 << 5;
        /// Cancellation received mid-transition, delivered when it lands
        const DEFERRED_CANCEL = 1 << 6;
    }
}

/// Stable thread identifier (pid-equivalent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creation attributes for `init_thread`
#[derive(Debug, Clone)]
pub struct ThreadAttr {
    pub name: Name,
    pub policy: Policy,
    pub prio: i32,
    pub cpu: usize,
    pub affinity: CpuMask,
    pub quantum: Duration,
}

/// Default round-robin quantum
pub const DEFAULT_RR_QUANTUM: Duration = Duration::from_ms(10);

impl ThreadAttr {
    pub fn new(name: &str, policy: Policy, prio: i32) -> Self {
        Self {
            name: bounded_name(name),
            policy,
            prio,
            cpu: 0,
            affinity: CpuMask::all(),
            quantum: if policy.timesliced() {
                DEFAULT_RR_QUANTUM
            } else {
                Duration::ZERO
            },
        }
    }

    pub fn on_cpu(mut self, cpu: usize) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn affinity(mut self, mask: CpuMask) -> Self {
        self.affinity = mask;
        self
    }

    pub fn quantum(mut self, quantum: Duration) -> Self {
        self.quantum = quantum;
        self
    }
}

/// Thread control block
pub(crate) struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) name: Name,
    pub(crate) policy: Policy,
    pub(crate) class: &'static dyn SchedClass,
    /// Base priority as set by the owner
    pub(crate) bprio: i32,
    /// Current (possibly boosted) priority
    pub(crate) cprio: i32,
    /// Weighted priority: cprio + class weight, the ready-queue key
    pub(crate) wprio: i32,
    pub(crate) state: ThreadState,
    pub(crate) info: ThreadInfo,
    pub(crate) stage: Stage,
    pub(crate) affinity: CpuMask,
    pub(crate) cpu: usize,
    pub(crate) ready_seq: i64,
    pub(crate) quantum: Duration,
    pub(crate) wchan: Option<WaitQueueId>,
    /// Generation of the current wait; stale waiter entries fail this check
    pub(crate) wait_seq: u64,
    pub(crate) sleep_timer: Option<TimerId>,
    pub(crate) migration_target: Option<usize>,
    pub(crate) stats: ThreadStats,
}

/// Arena of thread control blocks
pub(crate) struct ThreadArena {
    map: Mutex<HashMap<u64, Arc<Mutex<Thread>>>>,
    next: AtomicU64,
}

impl ThreadArena {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    fn alloc_id(&self) -> ThreadId {
        ThreadId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, thread: Thread) -> ThreadId {
        let id = thread.id;
        self.map.lock().insert(id.0, Arc::new(Mutex::new(thread)));
        id
    }

    pub(crate) fn get(&self, id: ThreadId) -> Option<Arc<Mutex<Thread>>> {
        self.map.lock().get(&id.0).cloned()
    }

    fn remove(&self, id: ThreadId) -> Option<Arc<Mutex<Thread>>> {
        self.map.lock().remove(&id.0)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }
}

impl Core {
    /// Map a new real-time thread.
    ///
    /// The thread starts DORMANT in the in-band stage. Fails closed on an
    /// out-of-range priority or a CPU placement outside the affinity mask;
    /// nothing is created in that case.
    pub fn init_thread(&self, attr: ThreadAttr) -> Result<ThreadId> {
        let class = class_of(attr.policy);
        class.validate(attr.prio)?;
        self.check_cpu(attr.cpu)?;
        let affinity = attr.affinity.intersect(&self.online_mask());
        if affinity.is_empty() || !affinity.is_set(attr.cpu) {
            return Err(Error::InvalidCpu { cpu: attr.cpu });
        }

        let id = self.threads.alloc_id();
        let thread = Thread {
            id,
            name: attr.name.clone(),
            policy: attr.policy,
            class,
            bprio: attr.prio,
            cprio: attr.prio,
            wprio: weighted_prio(class, attr.prio),
            state: ThreadState::DORMANT | ThreadState::INBAND,
            info: ThreadInfo::empty(),
            stage: Stage::InBand,
            affinity,
            cpu: attr.cpu,
            ready_seq: 0,
            quantum: attr.quantum,
            wchan: None,
            wait_seq: 0,
            sleep_timer: None,
            migration_target: None,
            stats: ThreadStats::new(),
        };
        self.threads.insert(thread);

        // Every thread owns one wait/sleep timer for its lifetime.
        let timer = self.create_timer(attr.name.as_str(), TimerHandler::WakeThread(id));
        if let Some(arc) = self.threads.get(id) {
            arc.lock().sleep_timer = Some(timer);
        }
        log::debug!(
            "thread {}: mapped '{}' prio {} on cpu {}",
            id,
            attr.name.as_str(),
            attr.prio,
            attr.cpu
        );
        Ok(id)
    }

    /// Start a dormant thread: its first crossing into the oob stage.
    ///
    /// Clears DORMANT, hands the in-band context over, and enqueues the
    /// thread on its CPU's runqueue (stage `SwitchingToOob` until first
    /// picked).
    pub fn start_thread(&self, caller_cpu: usize, tid: ThreadId) -> Result<()> {
        self.check_cpu(caller_cpu)?;
        let (cpu, kick) = self.with_thread_rq(tid, |core, rq, t| {
            if !t.state.contains(ThreadState::DORMANT) {
                return Err(Error::InvalidState {
                    reason: "thread is not dormant",
                });
            }
            t.state.remove(ThreadState::DORMANT);
            core.begin_oob_switch_locked(rq, t);
            Ok((t.cpu, rq.set_resched()))
        })??;
        self.platform.inband_suspend(tid);
        self.kick_cpu(cpu, caller_cpu, kick);
        Ok(())
    }

    /// Change a thread's priority.
    ///
    /// A READY thread is re-queued at its new weighted priority (position is
    /// priority-ordered, not FIFO-stable across changes); a running thread
    /// triggers an immediate preemption check on its CPU.
    pub fn set_priority(&self, caller_cpu: usize, tid: ThreadId, prio: i32) -> Result<()> {
        self.check_cpu(caller_cpu)?;
        let (cpu, kick) = self.with_thread_rq(tid, |_core, rq, t| {
            t.class.validate(prio)?;
            let wprio = weighted_prio(t.class, prio);
            let was_ready = t.state.contains(ThreadState::READY);
            if was_ready {
                rq.dequeue(t);
            }
            t.bprio = prio;
            t.cprio = prio;
            t.wprio = wprio;
            let mut kick = false;
            if was_ready {
                rq.enqueue_tail(t);
                if rq.curr.is_none() || wprio > rq.curr_wprio {
                    kick = rq.set_resched();
                }
            } else if rq.curr == Some(t.id) {
                rq.curr_wprio = wprio;
                if rq.first().is_some_and(|head| head.wprio > wprio) {
                    kick = rq.set_resched();
                }
            }
            log::trace!("thread {}: priority -> {} (wprio {})", t.id, prio, wprio);
            Ok((t.cpu, kick))
        })??;
        self.kick_cpu(cpu, caller_cpu, kick);
        Ok(())
    }

    /// Administratively suspend a thread (ORed HELD bit)
    pub fn hold_thread(&self, caller_cpu: usize, tid: ThreadId) -> Result<()> {
        self.check_cpu(caller_cpu)?;
        let (cpu, kick) = self.with_thread_rq(tid, |_core, rq, t| {
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::InvalidState {
                    reason: "thread has exited",
                });
            }
            if t.state.contains(ThreadState::READY) {
                rq.dequeue(t);
            }
            t.state.insert(ThreadState::HELD);
            let kick = if rq.curr == Some(t.id) {
                rq.set_resched()
            } else {
                false
            };
            log::trace!("thread {}: held", t.id);
            Ok((t.cpu, kick))
        })??;
        self.kick_cpu(cpu, caller_cpu, kick);
        Ok(())
    }

    /// Release a held thread; it becomes READY again if nothing else blocks it
    pub fn release_thread(&self, caller_cpu: usize, tid: ThreadId) -> Result<()> {
        self.check_cpu(caller_cpu)?;
        let (cpu, kick) = self.with_thread_rq(tid, |_core, rq, t| {
            if !t.state.contains(ThreadState::HELD) {
                return Err(Error::InvalidState {
                    reason: "thread is not held",
                });
            }
            t.state.remove(ThreadState::HELD);
            let mut kick = false;
            if t.state.runnable() && rq.curr != Some(t.id) {
                rq.enqueue_tail(t);
                kick = rq.set_resched();
            }
            log::trace!("thread {}: released", t.id);
            Ok((t.cpu, kick))
        })??;
        self.kick_cpu(cpu, caller_cpu, kick);
        Ok(())
    }

    /// Cancel a thread.
    ///
    /// Mid-transition cancellations are deferred and re-delivered once the
    /// stage machine lands in a stable state; the thread then finishes in a
    /// clean in-band terminal state, never half-transitioned. Cancelling the
    /// running thread takes effect at its next switch-out.
    pub fn cancel_thread(&self, caller_cpu: usize, tid: ThreadId) -> Result<()> {
        self.check_cpu(caller_cpu)?;
        let (cpu, kick, resume) = self.with_thread_rq(tid, |core, rq, t| {
            if t.state.contains(ThreadState::ZOMBIE) {
                return (t.cpu, false, false);
            }
            if matches!(t.stage, Stage::SwitchingToOob | Stage::SwitchingToInband) {
                t.info.insert(ThreadInfo::DEFERRED_CANCEL);
                log::trace!("thread {}: cancel deferred mid-transition", t.id);
                return (t.cpu, rq.set_resched(), false);
            }
            if rq.curr == Some(t.id) {
                t.info.insert(ThreadInfo::CANCELLED | ThreadInfo::KICKED);
                return (t.cpu, rq.set_resched(), false);
            }
            let resume = core.finalize_cancel_locked(rq, t);
            (t.cpu, false, resume)
        })?;
        if resume {
            self.platform.inband_resume(tid);
        }
        self.kick_cpu(cpu, caller_cpu, kick);
        Ok(())
    }

    /// Reap an exited thread, destroying its control block.
    ///
    /// Fails with `InvalidState` until the thread is a ZOMBIE; the in-band
    /// caller owns the retry.
    pub fn join_thread(&self, tid: ThreadId) -> Result<()> {
        let arc = self
            .threads
            .get(tid)
            .ok_or(Error::NoSuchThread { id: tid.0 })?;
        let timer = {
            let t = arc.lock();
            if !t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::InvalidState {
                    reason: "thread has not exited",
                });
            }
            t.sleep_timer
        };
        if let Some(timer) = timer {
            let _ = self.destroy_timer(timer);
        }
        self.threads.remove(tid);
        log::debug!("thread {}: joined", tid);
        Ok(())
    }

    /// Terminate the calling thread (must be current on `cpu`)
    pub fn exit_current(&self, cpu: usize) -> Result<ThreadId> {
        self.check_cpu(cpu)?;
        let tid = self
            .current(cpu)
            .ok_or(Error::InvalidState { reason: "cpu is idle" })?;
        self.cancel_thread(cpu, tid)?;
        Ok(tid)
    }

    /// Land a cancellation: detach from every structure and park the thread
    /// as an in-band ZOMBIE. Returns true if the thread was oob-owned and the
    /// in-band side must be resumed for teardown. Caller fixes `rq.curr`.
    pub(crate) fn finalize_cancel_locked(&self, rq: &mut RunQueue, t: &mut Thread) -> bool {
        if t.state.contains(ThreadState::READY) {
            rq.dequeue(t);
        }
        let was_oob = !t.state.contains(ThreadState::INBAND);
        if let Some(timer) = t.sleep_timer {
            let _ = self.timer_stop(timer);
        }
        t.state.remove(
            ThreadState::PENDING
                | ThreadState::DELAYED
                | ThreadState::DORMANT
                | ThreadState::HELD
                | ThreadState::RRB,
        );
        t.wchan = None;
        t.state.insert(ThreadState::ZOMBIE | ThreadState::INBAND);
        t.stage = Stage::InBand;
        t.info.remove(ThreadInfo::DEFERRED_CANCEL);
        t.info.insert(ThreadInfo::CANCELLED);
        t.migration_target = None;
        log::debug!("thread {}: cancelled (zombie)", t.id);
        was_oob
    }

    /// Unblock a PENDING/DELAYED thread with `reason` info bits.
    ///
    /// Returns `(woken, kick)`; `kick` is true when this call newly flagged a
    /// reschedule on the thread's CPU. The loser of a wake/timeout race
    /// observes the thread already unblocked and returns `(false, false)`.
    pub(crate) fn unblock_locked(
        &self,
        rq: &mut RunQueue,
        t: &mut Thread,
        reason: ThreadInfo,
    ) -> (bool, bool) {
        if !t.state.intersects(ThreadState::PENDING | ThreadState::DELAYED) {
            return (false, false);
        }
        t.state.remove(ThreadState::PENDING | ThreadState::DELAYED);
        t.wchan = None;
        t.wait_seq = t.wait_seq.wrapping_add(1);
        if let Some(timer) = t.sleep_timer {
            let _ = self.timer_stop(timer);
        }
        t.info.insert(reason);
        let mut kick = false;
        if t.state.runnable() && rq.curr != Some(t.id) {
            rq.enqueue_tail(t);
            kick = rq.set_resched();
        }
        log::trace!("thread {}: unblocked ({:?})", t.id, reason);
        (true, kick)
    }

    /// Wait-timeout expiry path (timer handler); a no-op if a wakeup won
    pub(crate) fn timed_unblock(&self, tid: ThreadId, caller_cpu: usize) -> Result<()> {
        let (cpu, woken, kick) = self.with_thread_rq(tid, |core, rq, t| {
            let (woken, kick) = core.unblock_locked(rq, t, ThreadInfo::TIMEDOUT);
            if woken {
                t.stats.timeouts.inc();
            }
            (t.cpu, woken, kick)
        })?;
        if woken {
            self.kick_cpu(cpu, caller_cpu, kick);
        }
        Ok(())
    }

    // ─── Inspection ─────────────────────────────────────────────────────────

    /// Status bits of a thread
    pub fn thread_state(&self, tid: ThreadId) -> Result<ThreadState> {
        self.with_thread(tid, |t| t.state)
    }

    /// Info bits of a thread
    pub fn thread_info(&self, tid: ThreadId) -> Result<ThreadInfo> {
        self.with_thread(tid, |t| t.info)
    }

    /// Stage the thread currently belongs to
    pub fn thread_stage(&self, tid: ThreadId) -> Result<Stage> {
        self.with_thread(tid, |t| t.stage)
    }

    /// Current priority
    pub fn thread_priority(&self, tid: ThreadId) -> Result<i32> {
        self.with_thread(tid, |t| t.cprio)
    }

    /// Base priority as last set by the owner (current priority may diverge
    /// under a future boosting protocol)
    pub fn thread_base_priority(&self, tid: ThreadId) -> Result<i32> {
        self.with_thread(tid, |t| t.bprio)
    }

    /// CPU the thread is placed on
    pub fn thread_cpu(&self, tid: ThreadId) -> Result<usize> {
        self.with_thread(tid, |t| t.cpu)
    }

    /// Name the thread was mapped with
    pub fn thread_name(&self, tid: ThreadId) -> Result<Name> {
        self.with_thread(tid, |t| t.name.clone())
    }

    /// Accounting snapshot
    pub fn thread_stats(&self, tid: ThreadId) -> Result<StatsSnapshot> {
        self.with_thread(tid, |t| t.stats.snapshot())
    }

    /// Number of mapped threads
    pub fn nr_threads(&self) -> usize {
        self.threads.len()
    }

    fn with_thread<R>(&self, tid: ThreadId, f: impl FnOnce(&Thread) -> R) -> Result<R> {
        let arc = self
            .threads
            .get(tid)
            .ok_or(Error::NoSuchThread { id: tid.0 })?;
        let t = arc.lock();
        Ok(f(&t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_validates_priority() {
        let core = Core::new(1);
        let err = core
            .init_thread(ThreadAttr::new("bad", Policy::Fifo, 0))
            .unwrap_err();
        assert_eq!(err, Error::InvalidPriority { value: 0, min: 1, max: 99 });
        assert_eq!(core.nr_threads(), 0);
    }

    #[test]
    fn test_init_validates_placement() {
        let core = Core::new(2);
        // CPU outside the configured range.
        let err = core
            .init_thread(ThreadAttr::new("off", Policy::Fifo, 10).on_cpu(5))
            .unwrap_err();
        assert_eq!(err, Error::InvalidCpu { cpu: 5 });
        // Placement CPU outside the affinity mask.
        let err = core
            .init_thread(
                ThreadAttr::new("off", Policy::Fifo, 10)
                    .on_cpu(0)
                    .affinity(CpuMask::single(1)),
            )
            .unwrap_err();
        assert_eq!(err, Error::InvalidCpu { cpu: 0 });
    }

    #[test]
    fn test_dormant_until_started() {
        let core = Core::new(1);
        let tid = core
            .init_thread(ThreadAttr::new("worker", Policy::Fifo, 10))
            .unwrap();
        let state = core.thread_state(tid).unwrap();
        assert!(state.contains(ThreadState::DORMANT));
        assert!(state.contains(ThreadState::INBAND));
        assert_eq!(core.thread_stage(tid).unwrap(), Stage::InBand);

        core.start_thread(0, tid).unwrap();
        assert!(!core.thread_state(tid).unwrap().contains(ThreadState::DORMANT));
        // Already started: starting again is a state error.
        assert!(core.start_thread(0, tid).is_err());
    }

    #[test]
    fn test_join_requires_zombie() {
        let core = Core::new(1);
        let tid = core
            .init_thread(ThreadAttr::new("w", Policy::Fifo, 10))
            .unwrap();
        assert!(core.join_thread(tid).is_err());
        core.cancel_thread(0, tid).unwrap();
        assert!(core
            .thread_state(tid)
            .unwrap()
            .contains(ThreadState::ZOMBIE));
        core.join_thread(tid).unwrap();
        assert_eq!(
            core.join_thread(tid).unwrap_err(),
            Error::NoSuchThread { id: tid.0 }
        );
    }

    #[test]
    fn test_runnable_predicate() {
        let ready = ThreadState::READY;
        assert!(ready.runnable());
        assert!(!(ready | ThreadState::HELD).runnable());
        assert!(!(ThreadState::INBAND).runnable());
        assert!(!(ThreadState::ZOMBIE).runnable());
    }
}
