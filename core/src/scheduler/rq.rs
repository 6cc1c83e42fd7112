//! Per-CPU runqueue
//!
//! Each CPU owns one `RunQueue` behind its own lock. The ready structure is a
//! single ordered set keyed by (weighted priority desc, sequence asc): pick is
//! the first element, O(log n). Fresh wakeups enqueue at the tail of their
//! priority band (become-ready order); a preempted thread is put back at the
//! head of its band so it resumes before equal-priority peers.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::cmp::Ordering;

use crate::hard_assert;
use crate::scheduler::thread::{Thread, ThreadId, ThreadState};
use crate::time::TimerId;

bitflags! {
    /// Runqueue control flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RqFlags: u32 {
        /// A rescheduling pass is requested for this CPU
        const SCHED = 1 << 0;
        /// No oob thread is current; the CPU has fallen back in-band
        const IDLE  = 1 << 1;
    }
}

/// Ready-queue ordering key: higher weighted priority first, then
/// become-ready order, then id as a total-order tie break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadyKey {
    pub(crate) wprio: i32,
    pub(crate) seq: i64,
    pub(crate) tid: u64,
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wprio
            .cmp(&self.wprio)
            .then(self.seq.cmp(&other.seq))
            .then(self.tid.cmp(&other.tid))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Scheduler state for one CPU
pub(crate) struct RunQueue {
    pub(crate) cpu: usize,
    pub(crate) flags: RqFlags,
    pub(crate) curr: Option<ThreadId>,
    /// Weighted priority of `curr` (meaningful only while `curr` is some);
    /// cached here so preemption checks never take a second thread lock.
    pub(crate) curr_wprio: i32,
    ready: BTreeSet<ReadyKey>,
    next_seq: i64,
    front_seq: i64,
    pub(crate) rrb_timer: Option<TimerId>,
    pub(crate) wd_timer: Option<TimerId>,
    pub(crate) nr_switches: u64,
}

impl RunQueue {
    pub(crate) fn new(cpu: usize) -> Self {
        Self {
            cpu,
            flags: RqFlags::IDLE,
            curr: None,
            curr_wprio: i32::MIN,
            ready: BTreeSet::new(),
            next_seq: 1,
            front_seq: 0,
            rrb_timer: None,
            wd_timer: None,
            nr_switches: 0,
        }
    }

    /// Request a rescheduling pass; true if this call newly flagged it
    pub(crate) fn set_resched(&mut self) -> bool {
        if self.flags.contains(RqFlags::SCHED) {
            false
        } else {
            self.flags.insert(RqFlags::SCHED);
            true
        }
    }

    /// Insert at the tail of the thread's priority band (become-ready order)
    pub(crate) fn enqueue_tail(&mut self, t: &mut Thread) {
        hard_assert!(!t.state.contains(ThreadState::READY), "enqueue of READY thread");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert(t, seq);
    }

    /// Insert at the head of the thread's priority band (preempted putback)
    pub(crate) fn enqueue_head(&mut self, t: &mut Thread) {
        hard_assert!(!t.state.contains(ThreadState::READY), "requeue of READY thread");
        let seq = self.front_seq;
        self.front_seq -= 1;
        self.insert(t, seq);
    }

    fn insert(&mut self, t: &mut Thread, seq: i64) {
        t.ready_seq = seq;
        t.cpu = self.cpu;
        let inserted = self.ready.insert(ReadyKey {
            wprio: t.wprio,
            seq,
            tid: t.id.0,
        });
        hard_assert!(inserted, "thread already on a ready structure");
        t.state.insert(ThreadState::READY);
    }

    /// Remove the thread from the ready structure
    pub(crate) fn dequeue(&mut self, t: &mut Thread) {
        let removed = self.ready.remove(&ReadyKey {
            wprio: t.wprio,
            seq: t.ready_seq,
            tid: t.id.0,
        });
        hard_assert!(removed, "READY thread missing from its ready structure");
        t.state.remove(ThreadState::READY);
    }

    /// Highest-priority ready entry
    pub(crate) fn first(&self) -> Option<ReadyKey> {
        self.ready.first().copied()
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Ready thread ids in pick order (diagnostics / invariant checks)
    pub(crate) fn ready_ids(&self) -> Vec<ThreadId> {
        self.ready.iter().map(|k| ThreadId(k.tid)).collect()
    }

    pub(crate) fn contains(&self, t: &Thread) -> bool {
        self.ready.contains(&ReadyKey {
            wprio: t.wprio,
            seq: t.ready_seq,
            tid: t.id.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_key_order() {
        let high = ReadyKey { wprio: 90, seq: 5, tid: 1 };
        let low_earlier = ReadyKey { wprio: 10, seq: 1, tid: 2 };
        let peer_later = ReadyKey { wprio: 90, seq: 7, tid: 3 };
        let preempted = ReadyKey { wprio: 90, seq: -1, tid: 4 };

        let mut set = BTreeSet::new();
        set.insert(low_earlier);
        set.insert(peer_later);
        set.insert(high);
        set.insert(preempted);

        let order: alloc::vec::Vec<u64> = set.iter().map(|k| k.tid).collect();
        // Preempted head first, then FIFO among the 90s, lowest band last.
        assert_eq!(order, [4, 1, 3, 2]);
    }
}
