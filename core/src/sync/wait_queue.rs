//! Wait channels
//!
//! The rendezvous points threads block on and are woken from; mutexes and
//! condition variables are built on top of these. Channels live in an arena
//! referenced by stable ids. A waiter entry carries the thread's wait
//! generation: the timeout path unblocks the thread without touching the
//! list, and the stale entry is skipped (and discarded) by the next wake.
//! Whichever of wake and timeout runs first under the thread's runqueue lock
//! wins; the loser observes a no-op.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::scheduler::thread::{ThreadId, ThreadInfo, ThreadState};
use crate::time::clock::ClockId;
use crate::time::{Duration, Timeout, Timestamp};
use crate::{bounded_name, Core, Name};

/// Stable wait-channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitQueueId(pub u64);

/// Waiter ordering on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Wake in arrival order
    Fifo,
    /// Wake by weighted priority, FIFO among equals (mutex-style channels)
    Prio,
}

/// How many waiters a wakeup targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSelector {
    One,
    All,
}

struct Waiter {
    tid: ThreadId,
    wprio: i32,
    wait_seq: u64,
}

/// One wait channel
pub(crate) struct WaitChannel {
    #[allow(dead_code)]
    id: WaitQueueId,
    name: Name,
    policy: WaitPolicy,
    waiters: Vec<Waiter>,
}

impl WaitChannel {
    fn insert_waiter(&mut self, waiter: Waiter) {
        match self.policy {
            WaitPolicy::Fifo => self.waiters.push(waiter),
            WaitPolicy::Prio => {
                let pos = self
                    .waiters
                    .iter()
                    .position(|w| w.wprio < waiter.wprio)
                    .unwrap_or(self.waiters.len());
                self.waiters.insert(pos, waiter);
            }
        }
    }

    fn pop_front(&mut self) -> Option<Waiter> {
        if self.waiters.is_empty() {
            None
        } else {
            Some(self.waiters.remove(0))
        }
    }
}

/// Arena of wait channels
pub(crate) struct WaitArena {
    map: Mutex<HashMap<u64, Arc<Mutex<WaitChannel>>>>,
    next: AtomicU64,
}

impl WaitArena {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    fn get(&self, id: WaitQueueId) -> Result<Arc<Mutex<WaitChannel>>> {
        self.map
            .lock()
            .get(&id.0)
            .cloned()
            .ok_or(Error::NoSuchWaitQueue { id: id.0 })
    }
}

impl Core {
    /// Create a wait channel
    pub fn create_wait_queue(&self, name: &str, policy: WaitPolicy) -> WaitQueueId {
        let id = WaitQueueId(self.wchans.next.fetch_add(1, Ordering::Relaxed));
        let chan = WaitChannel {
            id,
            name: bounded_name(name),
            policy,
            waiters: Vec::new(),
        };
        self.wchans.map.lock().insert(id.0, Arc::new(Mutex::new(chan)));
        log::trace!("wait queue {}: created ({})", id.0, name);
        id
    }

    /// Tear a wait channel down, flushing every leftover waiter with the
    /// abnormal-wakeup info bit
    pub fn destroy_wait_queue(&self, caller_cpu: usize, wq: WaitQueueId) -> Result<()> {
        self.flush_wait(caller_cpu, wq)?;
        self.wchans
            .map
            .lock()
            .remove(&wq.0)
            .map(|_| ())
            .ok_or(Error::NoSuchWaitQueue { id: wq.0 })
    }

    /// Block the calling thread on a wait channel.
    ///
    /// Atomically (under the channel and runqueue locks) marks the thread
    /// PENDING, removes it from the ready structure, links it into the waiter
    /// list and, for a finite `timeout`, arms its wait timer on `clock`.
    /// Returns after switching away; the caller distinguishes a wakeup from a
    /// timeout via the thread's info bits.
    pub fn sleep_on(
        &self,
        caller_cpu: usize,
        tid: ThreadId,
        wq: WaitQueueId,
        clock: ClockId,
        timeout: Timeout,
    ) -> Result<()> {
        self.check_cpu(caller_cpu)?;
        let chan = self.wchans.get(wq)?;
        let clock_ref = self.clock(clock)?;

        {
            let mut ch = chan.lock();
            self.with_thread_rq(tid, |core, rq, t| {
                if rq.curr != Some(t.id) || t.cpu != caller_cpu {
                    return Err(Error::NotCurrent { id: t.id.0 });
                }
                if t.state.intersects(ThreadState::ZOMBIE | ThreadState::INBAND) {
                    return Err(Error::InvalidState {
                        reason: "thread cannot block",
                    });
                }
                t.info
                    .remove(ThreadInfo::TIMEDOUT | ThreadInfo::WAKEN | ThreadInfo::BROKEN);
                t.wait_seq = t.wait_seq.wrapping_add(1);
                t.wchan = Some(wq);
                t.state.insert(ThreadState::PENDING);
                ch.insert_waiter(Waiter {
                    tid: t.id,
                    wprio: t.wprio,
                    wait_seq: t.wait_seq,
                });
                if let Some(deadline) = timeout.deadline(clock_ref.now()) {
                    t.state.insert(ThreadState::DELAYED);
                    if let Some(timer) = t.sleep_timer {
                        core.timer_start(timer, clock, t.cpu, deadline, Duration::ZERO)?;
                    }
                }
                rq.set_resched();
                log::trace!("thread {}: sleeping on wait queue {}", t.id, wq.0);
                Ok(())
            })??;
        }
        self.schedule(caller_cpu);
        Ok(())
    }

    /// Block the calling thread until an absolute deadline on `clock`
    /// (timer-only sleep, no wait channel).
    pub fn sleep_until(
        &self,
        caller_cpu: usize,
        tid: ThreadId,
        clock: ClockId,
        deadline: Timestamp,
    ) -> Result<()> {
        self.check_cpu(caller_cpu)?;
        let _ = self.clock(clock)?;
        self.with_thread_rq(tid, |core, rq, t| {
            if rq.curr != Some(t.id) || t.cpu != caller_cpu {
                return Err(Error::NotCurrent { id: t.id.0 });
            }
            if t.state.intersects(ThreadState::ZOMBIE | ThreadState::INBAND) {
                return Err(Error::InvalidState {
                    reason: "thread cannot block",
                });
            }
            t.info.remove(ThreadInfo::TIMEDOUT | ThreadInfo::WAKEN);
            t.state.insert(ThreadState::DELAYED);
            if let Some(timer) = t.sleep_timer {
                core.timer_start(timer, clock, t.cpu, deadline, Duration::ZERO)?;
            }
            rq.set_resched();
            log::trace!("thread {}: sleeping until {}ns", t.id, deadline.as_ns());
            Ok(())
        })??;
        self.schedule(caller_cpu);
        Ok(())
    }

    /// Wake one or all waiters: unlink, cancel the wait timer, mark READY and
    /// reschedule each woken thread's CPU. Returns the number woken.
    pub fn wake_up(&self, caller_cpu: usize, wq: WaitQueueId, selector: WakeSelector) -> Result<u32> {
        self.wake_common(caller_cpu, wq, selector, ThreadInfo::WAKEN)
    }

    /// Wake every waiter with the abnormal/flush info bit (object teardown);
    /// distinct from a normal wake.
    pub fn flush_wait(&self, caller_cpu: usize, wq: WaitQueueId) -> Result<u32> {
        self.wake_common(caller_cpu, wq, WakeSelector::All, ThreadInfo::BROKEN)
    }

    /// Waiters currently linked on the channel (stale entries pruned lazily
    /// by the wake paths are not counted)
    pub fn wait_queue_len(&self, wq: WaitQueueId) -> Result<usize> {
        let chan = self.wchans.get(wq)?;
        let ch = chan.lock();
        Ok(ch.waiters.len())
    }

    /// Name the channel was created with
    pub fn wait_queue_name(&self, wq: WaitQueueId) -> Result<Name> {
        let chan = self.wchans.get(wq)?;
        let ch = chan.lock();
        Ok(ch.name.clone())
    }

    fn wake_common(
        &self,
        caller_cpu: usize,
        wq: WaitQueueId,
        selector: WakeSelector,
        reason: ThreadInfo,
    ) -> Result<u32> {
        self.check_cpu(caller_cpu)?;
        let chan = self.wchans.get(wq)?;
        let mut woken = 0u32;
        let mut kicks: Vec<(usize, bool)> = Vec::new();
        {
            let mut ch = chan.lock();
            while let Some(w) = ch.pop_front() {
                let unblocked = self.with_thread_rq(w.tid, |core, rq, t| {
                    // A stale entry: the thread timed out, was cancelled, or
                    // sits in a newer wait on this channel.
                    if t.wchan != Some(wq) || t.wait_seq != w.wait_seq {
                        return None;
                    }
                    let (woke, kick) = core.unblock_locked(rq, t, reason);
                    if !woke {
                        return None;
                    }
                    if t.cpu != caller_cpu {
                        t.stats.rwa.inc();
                    }
                    Some((t.cpu, kick))
                });
                match unblocked {
                    Ok(Some((cpu, kick))) => {
                        woken += 1;
                        kicks.push((cpu, kick));
                        if matches!(selector, WakeSelector::One) {
                            break;
                        }
                    }
                    // Stale entry or reaped thread: keep draining.
                    Ok(None) | Err(_) => {}
                }
            }
            if woken > 0 {
                log::trace!("wait queue {}: woke {} waiter(s)", wq.0, woken);
            }
        }
        for (cpu, kick) in kicks {
            self.kick_cpu(cpu, caller_cpu, kick);
        }
        Ok(woken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prio_insertion_order() {
        let mut chan = WaitChannel {
            id: WaitQueueId(1),
            name: bounded_name("w"),
            policy: WaitPolicy::Prio,
            waiters: Vec::new(),
        };
        chan.insert_waiter(Waiter { tid: ThreadId(1), wprio: 10, wait_seq: 1 });
        chan.insert_waiter(Waiter { tid: ThreadId(2), wprio: 30, wait_seq: 1 });
        chan.insert_waiter(Waiter { tid: ThreadId(3), wprio: 10, wait_seq: 1 });
        let order: Vec<u64> = chan.waiters.iter().map(|w| w.tid.0).collect();
        // Highest priority first, FIFO among equals.
        assert_eq!(order, [2, 1, 3]);
    }

    #[test]
    fn test_fifo_insertion_order() {
        let mut chan = WaitChannel {
            id: WaitQueueId(1),
            name: bounded_name("w"),
            policy: WaitPolicy::Fifo,
            waiters: Vec::new(),
        };
        chan.insert_waiter(Waiter { tid: ThreadId(1), wprio: 10, wait_seq: 1 });
        chan.insert_waiter(Waiter { tid: ThreadId(2), wprio: 30, wait_seq: 1 });
        let order: Vec<u64> = chan.waiters.iter().map(|w| w.tid.0).collect();
        assert_eq!(order, [1, 2]);
    }
}
