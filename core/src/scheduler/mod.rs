//! Scheduler core
//!
//! Per-CPU runqueues and the pick/switch/reschedule pass. `schedule(cpu)` is
//! the single evaluation point: it test-and-clears the CPU's resched flag,
//! puts the outgoing thread back (or retires it), picks the highest-priority
//! ready thread (FIFO among equals) and installs it as current. Cross-CPU
//! work — remote reschedule, migration pickup — travels as an IPI through the
//! platform seam and is evaluated on the target CPU at its next safe point.

pub mod class;
pub mod rq;
pub mod stage;
pub mod thread;

use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::hard_assert;
use crate::scheduler::rq::{RqFlags, RunQueue};
use crate::scheduler::thread::{Thread, ThreadId, ThreadInfo, ThreadState};
use crate::time::{Duration, TimerId};
use crate::Core;

/// Work that must run after the runqueue lock is dropped
enum PostOp {
    InbandResume(ThreadId),
    Migrate(ThreadId),
    ArmTimer(TimerId, Duration),
    StopTimer(TimerId),
}

impl Core {
    /// Run `f` under `cpu`'s runqueue lock
    pub(crate) fn with_rq<R>(&self, cpu: usize, f: impl FnOnce(&mut RunQueue) -> R) -> R {
        let mut guard = self.rqs.get(cpu).lock();
        f(&mut guard)
    }

    /// Lock the thread together with its owning CPU's runqueue, revalidating
    /// the placement after both locks are held (the thread may migrate
    /// between reading `cpu` and acquiring the lock).
    pub(crate) fn with_thread_rq<R>(
        &self,
        tid: ThreadId,
        f: impl FnOnce(&Core, &mut RunQueue, &mut Thread) -> R,
    ) -> Result<R> {
        let arc = self
            .threads
            .get(tid)
            .ok_or(Error::NoSuchThread { id: tid.0 })?;
        loop {
            let cpu = { arc.lock().cpu };
            let mut rq = self.rqs.get(cpu).lock();
            let mut t = arc.lock();
            if t.cpu != cpu {
                continue;
            }
            return Ok(f(self, &mut rq, &mut t));
        }
    }

    /// Local caller evaluates immediately; a remote CPU is kicked once per
    /// pending pass.
    pub(crate) fn kick_cpu(&self, cpu: usize, caller_cpu: usize, newly_flagged: bool) {
        if cpu == caller_cpu {
            self.schedule(cpu);
        } else if newly_flagged {
            self.platform.send_ipi(cpu);
        }
    }

    /// Mark `cpu` as needing a rescheduling pass.
    ///
    /// When `cpu` is the caller's own CPU the pass runs before returning;
    /// a remote CPU gets an inter-processor interrupt and evaluates at its
    /// next safe point. Never blocks the caller.
    pub fn reschedule(&self, cpu: usize, caller_cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.check_cpu(caller_cpu)?;
        let newly = self.with_rq(cpu, |rq| rq.set_resched());
        self.kick_cpu(cpu, caller_cpu, newly);
        Ok(())
    }

    /// Entry hook for the reschedule IPI on the receiving CPU
    pub fn on_resched_ipi(&self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.schedule(cpu);
        Ok(())
    }

    /// Thread currently installed on `cpu`, if the CPU is not idle
    pub fn current(&self, cpu: usize) -> Option<ThreadId> {
        if cpu >= self.nr_cpus {
            return None;
        }
        self.rqs.get(cpu).lock().curr
    }

    /// Is the CPU idle from the oob point of view (fallen back in-band)?
    pub fn cpu_is_idle(&self, cpu: usize) -> bool {
        if cpu >= self.nr_cpus {
            return true;
        }
        self.rqs.get(cpu).lock().flags.contains(RqFlags::IDLE)
    }

    /// Ready thread ids on `cpu` in pick order (diagnostics)
    pub fn ready_threads(&self, cpu: usize) -> Vec<ThreadId> {
        if cpu >= self.nr_cpus {
            return Vec::new();
        }
        self.rqs.get(cpu).lock().ready_ids()
    }

    /// Context switches performed on `cpu` since bring-up
    pub fn nr_switches(&self, cpu: usize) -> u64 {
        if cpu >= self.nr_cpus {
            return 0;
        }
        self.rqs.get(cpu).lock().nr_switches
    }

    /// The rescheduling pass for `cpu`.
    ///
    /// A no-op unless a reschedule was requested. An empty ready structure
    /// leaves the CPU idle (in-band fallback) — never a panic.
    pub fn schedule(&self, cpu: usize) {
        if cpu >= self.nr_cpus {
            return;
        }
        let mut post: Vec<PostOp> = Vec::new();
        {
            let mut rq = self.rqs.get(cpu).lock();
            if !rq.flags.contains(RqFlags::SCHED) {
                return;
            }
            rq.flags.remove(RqFlags::SCHED);

            let prev = rq.curr;

            // Switch-out: retire, migrate or put back the outgoing thread.
            if let Some(ptid) = prev {
                match self.threads.get(ptid) {
                    Some(arc) => {
                        let mut t = arc.lock();
                        rq.curr = None;
                        if t.info.contains(ThreadInfo::CANCELLED)
                            && !t.state.contains(ThreadState::ZOMBIE)
                        {
                            if self.finalize_cancel_locked(&mut rq, &mut t) {
                                post.push(PostOp::InbandResume(ptid));
                            }
                        } else if t.migration_target.is_some() {
                            // Deferred migration: this is the thread's next
                            // scheduling point.
                            post.push(PostOp::Migrate(ptid));
                        } else if t.state.runnable() {
                            // Preempted, not blocked: resumes before its
                            // equal-priority peers.
                            rq.enqueue_head(&mut t);
                        }
                        // Otherwise the thread blocked or left the stage; its
                        // state transition already happened under this lock.
                    }
                    None => {
                        hard_assert!(false, "current thread vanished from the arena");
                        rq.curr = None;
                    }
                }
            }

            // Pick: head of the ordered ready structure. Candidates carrying
            // a deferred cancellation land in-band instead of running.
            let next = loop {
                let Some(key) = rq.first() else { break None };
                let Some(arc) = self.threads.get(ThreadId(key.tid)) else {
                    hard_assert!(false, "ready entry for unmapped thread");
                    break None;
                };
                let mut t = arc.lock();
                if t.info.contains(ThreadInfo::DEFERRED_CANCEL) {
                    rq.dequeue(&mut t);
                    if self.finalize_cancel_locked(&mut rq, &mut t) {
                        post.push(PostOp::InbandResume(t.id));
                    }
                    continue;
                }
                rq.dequeue(&mut t);
                self.finalize_oob_switch_locked(&mut t);
                if prev != Some(t.id) {
                    t.stats.csw.inc();
                }
                rq.curr = Some(t.id);
                rq.curr_wprio = t.wprio;
                rq.flags.remove(RqFlags::IDLE);
                rq.nr_switches += 1;
                let quantum = t
                    .state
                    .contains(ThreadState::RRB)
                    .then_some(t.quantum)
                    .filter(|q| !q.is_zero());
                break Some((t.id, quantum));
            };

            match next {
                Some((tid, quantum)) => {
                    if prev != Some(tid) {
                        log::trace!("cpu {}: switch {:?} -> {}", cpu, prev, tid);
                    }
                    if let Some(rrb) = rq.rrb_timer {
                        match quantum {
                            Some(q) => post.push(PostOp::ArmTimer(rrb, q)),
                            None => post.push(PostOp::StopTimer(rrb)),
                        }
                    }
                    if let Some(wd) = rq.wd_timer {
                        match self.watchdog_timeout() {
                            Some(d) => post.push(PostOp::ArmTimer(wd, d)),
                            None => post.push(PostOp::StopTimer(wd)),
                        }
                    }
                }
                None => {
                    rq.curr = None;
                    rq.curr_wprio = i32::MIN;
                    if !rq.flags.contains(RqFlags::IDLE) {
                        rq.flags.insert(RqFlags::IDLE);
                        log::trace!("cpu {}: idle, in-band fallback", cpu);
                    }
                    if let Some(rrb) = rq.rrb_timer {
                        post.push(PostOp::StopTimer(rrb));
                    }
                    if let Some(wd) = rq.wd_timer {
                        post.push(PostOp::StopTimer(wd));
                    }
                }
            }
        }

        for op in post {
            match op {
                PostOp::InbandResume(tid) => self.platform.inband_resume(tid),
                PostOp::Migrate(tid) => {
                    let _ = self.complete_migration(tid);
                }
                PostOp::ArmTimer(id, after) => {
                    if let Ok(now) = self.clock_gettime(self.monotonic) {
                        let _ =
                            self.timer_start(id, self.monotonic, cpu, now + after, Duration::ZERO);
                    }
                }
                PostOp::StopTimer(id) => {
                    let _ = self.timer_stop(id);
                }
            }
        }
    }

    /// Voluntarily give up the CPU: the current thread goes behind its
    /// equal-priority peers.
    pub fn yield_cpu(&self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.with_rq(cpu, |rq| {
            if let Some(tid) = rq.curr {
                if let Some(arc) = self.threads.get(tid) {
                    let mut t = arc.lock();
                    rq.curr = None;
                    if t.state.runnable() {
                        rq.enqueue_tail(&mut t);
                    }
                }
                rq.set_resched();
            }
        });
        self.schedule(cpu);
        Ok(())
    }

    /// Move a thread to another CPU.
    ///
    /// A queued or blocked thread moves immediately (both runqueue locks,
    /// ascending CPU order); moving the running thread is deferred to its
    /// next scheduling point. The target CPU is kicked for prompt pickup.
    pub fn migrate(&self, caller_cpu: usize, tid: ThreadId, target: usize) -> Result<()> {
        self.check_cpu(caller_cpu)?;
        self.check_cpu(target)?;

        enum Plan {
            Done,
            Deferred { cpu: usize, kick: bool },
            Inline,
        }

        let plan = self.with_thread_rq(tid, |_core, rq, t| {
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::InvalidState {
                    reason: "thread has exited",
                });
            }
            if !t.affinity.is_set(target) {
                return Err(Error::InvalidCpu { cpu: target });
            }
            if t.cpu == target {
                return Ok(Plan::Done);
            }
            if rq.curr == Some(t.id) {
                t.migration_target = Some(target);
                Ok(Plan::Deferred {
                    cpu: t.cpu,
                    kick: rq.set_resched(),
                })
            } else {
                Ok(Plan::Inline)
            }
        })??;

        match plan {
            Plan::Done => Ok(()),
            Plan::Deferred { cpu, kick } => {
                self.kick_cpu(cpu, caller_cpu, kick);
                Ok(())
            }
            Plan::Inline => {
                if let Some((cpu, kick)) = self.migrate_queued(tid, target)? {
                    // The thread became current in the meantime; deferred.
                    self.kick_cpu(cpu, caller_cpu, kick);
                    return Ok(());
                }
                self.reschedule(target, caller_cpu)
            }
        }
    }

    /// Immediate migration of a non-running thread: atomic remove-then-insert
    /// under both runqueue locks, lower-indexed CPU first. Returns the kick
    /// for a deferral if the thread turned out to be running.
    fn migrate_queued(&self, tid: ThreadId, target: usize) -> Result<Option<(usize, bool)>> {
        let arc = self
            .threads
            .get(tid)
            .ok_or(Error::NoSuchThread { id: tid.0 })?;
        loop {
            let src = { arc.lock().cpu };
            if src == target {
                return Ok(None);
            }
            let (lo, hi) = (src.min(target), src.max(target));
            let mut rq_lo = self.rqs.get(lo).lock();
            let mut rq_hi = self.rqs.get(hi).lock();
            let mut t = arc.lock();
            if t.cpu != src {
                continue;
            }
            let (rq_src, rq_dst) = if src == lo {
                (&mut *rq_lo, &mut *rq_hi)
            } else {
                (&mut *rq_hi, &mut *rq_lo)
            };
            if rq_src.curr == Some(tid) {
                t.migration_target = Some(target);
                return Ok(Some((src, rq_src.set_resched())));
            }
            let was_ready = t.state.contains(ThreadState::READY);
            if was_ready {
                rq_src.dequeue(&mut t);
            }
            t.cpu = target;
            let timer = t.sleep_timer;
            if was_ready {
                // The caller kicks the target through reschedule().
                rq_dst.enqueue_tail(&mut t);
            }
            log::debug!("thread {}: migrated cpu {} -> {}", tid, src, target);
            drop(t);
            drop(rq_hi);
            drop(rq_lo);
            // A queued wait/sleep timer follows its owner.
            if let Some(timer) = timer {
                let _ = self.timer_move(timer, target);
            }
            return Ok(None);
        }
    }

    /// Land a deferred migration after the thread switched out
    fn complete_migration(&self, tid: ThreadId) -> Result<()> {
        let arc = self
            .threads
            .get(tid)
            .ok_or(Error::NoSuchThread { id: tid.0 })?;
        let Some(target) = ({ arc.lock().migration_target }) else {
            return Ok(());
        };
        self.check_cpu(target)?;
        let (timer, newly, old) = {
            let mut rq = self.rqs.get(target).lock();
            let mut t = arc.lock();
            t.migration_target = None;
            let old = t.cpu;
            t.cpu = target;
            let mut newly = false;
            if t.state.runnable() && !t.state.contains(ThreadState::READY) {
                rq.enqueue_tail(&mut t);
                newly = rq.set_resched();
            }
            (t.sleep_timer, newly, old)
        };
        if let Some(timer) = timer {
            let _ = self.timer_move(timer, target);
        }
        if newly {
            self.platform.send_ipi(target);
        }
        log::debug!("thread {}: migration landed cpu {} -> {}", tid, old, target);
        Ok(())
    }

    /// Round-robin quantum expiry (timer handler): rotate the current thread
    /// behind its equal-priority peers.
    pub(crate) fn rr_tick(&self, cpu: usize) {
        if cpu >= self.nr_cpus {
            return;
        }
        self.with_rq(cpu, |rq| {
            if let Some(tid) = rq.curr {
                if let Some(arc) = self.threads.get(tid) {
                    let mut t = arc.lock();
                    if t.state.contains(ThreadState::RRB) {
                        rq.curr = None;
                        if t.state.runnable() {
                            rq.enqueue_tail(&mut t);
                        }
                        rq.set_resched();
                        log::trace!("cpu {}: quantum expired on thread {}", cpu, tid);
                    }
                }
            }
        });
        self.schedule(cpu);
    }
}
