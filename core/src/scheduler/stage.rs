//! Stage transition engine
//!
//! Execution ownership of a thread moves between the in-band kernel and this
//! co-scheduler through a four-state machine. The INBAND status bit and the
//! thread's runqueue membership change under the same per-CPU lock, so exactly
//! one scheduler is authoritative at every instant. Transitions are
//! synchronous state changes at defined safe points, never arbitrary
//! suspensions; a cancellation that arrives mid-transition is deferred until
//! the machine lands in a stable state.

use core::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::platform::InbandSignal;
use crate::scheduler::rq::RunQueue;
use crate::scheduler::thread::{Thread, ThreadId, ThreadInfo, ThreadState};
use crate::time::Duration;
use crate::Core;

/// Which scheduler owns a thread's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The general-purpose kernel's scheduler
    InBand,
    /// Handoff in flight: enqueued oob, not yet first-picked
    SwitchingToOob,
    /// This co-scheduler
    Oob,
    /// Handoff in flight back to the in-band kernel
    SwitchingToInband,
}

/// Why a thread is leaving the oob stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InbandCause {
    /// Explicit request by the thread or its owner
    Request,
    /// Oob watchdog expired: forced demotion
    Watchdog,
    /// Unrecoverable fault while executing oob code
    Fault,
}

impl Core {
    /// Move a mapped in-band thread to the oob stage.
    ///
    /// The thread is enqueued on its CPU's runqueue in `SwitchingToOob`; the
    /// transition completes to `Oob` when the scheduler first picks it.
    pub fn switch_oob(&self, caller_cpu: usize, tid: ThreadId) -> Result<()> {
        self.check_cpu(caller_cpu)?;
        let (cpu, kick) = self.with_thread_rq(tid, |core, rq, t| {
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::InvalidState {
                    reason: "thread has exited",
                });
            }
            if t.state.contains(ThreadState::DORMANT) {
                return Err(Error::InvalidState {
                    reason: "thread was never started",
                });
            }
            if !t.state.contains(ThreadState::INBAND) {
                // Already oob-owned; nothing to hand off.
                return Ok((t.cpu, false));
            }
            core.begin_oob_switch_locked(rq, t);
            Ok((t.cpu, rq.set_resched()))
        })??;
        self.platform.inband_suspend(tid);
        self.kick_cpu(cpu, caller_cpu, kick);
        Ok(())
    }

    /// Demote a thread to the in-band stage.
    ///
    /// Used for explicit requests, watchdog expiry and oob faults. The INBAND
    /// bit is set and the thread leaves the ready structure under the rq
    /// lock; the in-band kernel is then notified (plus a signal for forced
    /// causes), and the transition lands. A deferred cancellation is
    /// re-delivered once landed.
    pub fn switch_inband(&self, caller_cpu: usize, tid: ThreadId, cause: InbandCause) -> Result<()> {
        self.check_cpu(caller_cpu)?;
        let (cpu, was_curr, kick) = self.with_thread_rq(tid, |core, rq, t| {
            if t.state.contains(ThreadState::INBAND) {
                return Err(Error::InvalidState {
                    reason: "thread is already in-band",
                });
            }
            // A blocked thread leaves its wait broken before the handoff.
            core.unblock_locked(rq, t, ThreadInfo::BROKEN);
            t.stage = Stage::SwitchingToInband;
            t.state.insert(ThreadState::INBAND);
            t.state.remove(ThreadState::RRB);
            if t.state.contains(ThreadState::READY) {
                rq.dequeue(t);
            }
            if !matches!(cause, InbandCause::Request) {
                t.info.insert(ThreadInfo::KICKED);
            }
            let was_curr = rq.curr == Some(t.id);
            let kick = if was_curr { rq.set_resched() } else { false };
            log::debug!("thread {}: leaving oob ({:?})", t.id, cause);
            Ok((t.cpu, was_curr, kick))
        })??;

        // Switch away before the in-band side resumes the thread: a single
        // scheduler owns it at every instant.
        if was_curr {
            self.kick_cpu(cpu, caller_cpu, kick);
        }
        self.platform.inband_resume(tid);
        match cause {
            InbandCause::Request => {}
            InbandCause::Watchdog => self.platform.deliver_signal(tid, InbandSignal::Watchdog),
            InbandCause::Fault => self.platform.deliver_signal(tid, InbandSignal::Fault),
        }

        // Land the transition.
        let deferred = self.with_thread_rq(tid, |_core, _rq, t| {
            t.stage = Stage::InBand;
            t.stats.isw.inc();
            t.info.contains(ThreadInfo::DEFERRED_CANCEL)
        })?;
        if deferred {
            self.cancel_thread(caller_cpu, tid)?;
        }
        Ok(())
    }

    /// First leg of the oob handoff (rq + thread locks held)
    pub(crate) fn begin_oob_switch_locked(&self, rq: &mut RunQueue, t: &mut Thread) {
        t.stage = Stage::SwitchingToOob;
        t.state.remove(ThreadState::INBAND);
        if t.policy.timesliced() && !t.quantum.is_zero() {
            t.state.insert(ThreadState::RRB);
        }
        if t.state.runnable() && rq.curr != Some(t.id) {
            rq.enqueue_tail(t);
        }
        log::debug!("thread {}: entering oob", t.id);
    }

    /// Second leg: the handoff completes when the thread is first picked
    pub(crate) fn finalize_oob_switch_locked(&self, t: &mut Thread) {
        if t.stage == Stage::SwitchingToOob {
            t.stage = Stage::Oob;
            log::trace!("thread {}: oob handoff complete", t.id);
        }
    }

    /// Configure the oob watchdog: a thread running longer than `timeout`
    /// without yielding is forcibly demoted and signalled. `None` disables.
    pub fn set_watchdog_timeout(&self, timeout: Option<Duration>) {
        let ns = timeout.map_or(0, |d| d.as_ns());
        self.wd_ns.store(ns, Ordering::Relaxed);
    }

    pub(crate) fn watchdog_timeout(&self) -> Option<Duration> {
        match self.wd_ns.load(Ordering::Relaxed) {
            0 => None,
            ns => Some(Duration::from_ns(ns)),
        }
    }

    /// Watchdog expiry (timer handler): force the overrunning thread back
    /// in-band. A designed control-flow path, not an error.
    pub(crate) fn watchdog_fire(&self, cpu: usize) {
        let Some(tid) = self.current(cpu) else { return };
        let overran = self
            .with_thread_rq(tid, |_core, rq, t| {
                if rq.curr != Some(t.id) || t.state.contains(ThreadState::INBAND) {
                    return false;
                }
                t.info.insert(ThreadInfo::WATCHDOG);
                true
            })
            .unwrap_or(false);
        if overran {
            log::warn!("cpu {}: watchdog expired on thread {}, demoting", cpu, tid);
            let _ = self.switch_inband(cpu, tid, InbandCause::Watchdog);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_configuration() {
        let core = Core::new(1);
        assert_eq!(core.watchdog_timeout(), None);
        core.set_watchdog_timeout(Some(Duration::from_ms(4_000)));
        assert_eq!(core.watchdog_timeout(), Some(Duration::from_ms(4_000)));
        core.set_watchdog_timeout(None);
        assert_eq!(core.watchdog_timeout(), None);
    }

    #[test]
    fn test_switch_oob_rejects_unstarted_thread() {
        use crate::scheduler::thread::ThreadAttr;
        use crate::scheduler::class::Policy;

        let core = Core::new(1);
        let tid = core
            .init_thread(ThreadAttr::new("dormant", Policy::Fifo, 10))
            .unwrap();
        assert!(core.switch_oob(0, tid).is_err());
        assert_eq!(core.thread_stage(tid).unwrap(), Stage::InBand);
    }
}
