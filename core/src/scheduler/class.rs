//! Scheduling classes
//!
//! A small closed set of real-time policies, selected at thread-init time and
//! fixed for the thread's lifetime. Classes are separated by weight bands:
//! ordering everywhere uses the weighted priority `prio + class weight`, so a
//! FIFO thread always outranks a WEAK thread, which always outranks idle work.
//! Round-robin is FIFO plus a time quantum.

use crate::error::{Error, Result};

/// Weight separation between class bands; priorities never span it
pub const CLASS_WEIGHT_FACTOR: i32 = 1024;

/// Scheduling policy identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Real-time FIFO: runs until it blocks, yields or is preempted
    Fifo,
    /// Real-time round-robin: FIFO plus quantum rotation among equals
    RoundRobin,
    /// Weak band: real-time API, below every FIFO priority
    Weak,
    /// Idle band: runs only when nothing else is ready
    Idle,
}

impl Policy {
    /// Does this policy rotate equal-priority threads on a quantum?
    pub fn timesliced(&self) -> bool {
        matches!(self, Self::RoundRobin)
    }
}

/// Per-class pick/queueing parameters
pub trait SchedClass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Band weight added to thread priorities
    fn weight(&self) -> i32;

    fn prio_min(&self) -> i32;

    fn prio_max(&self) -> i32;

    /// Fail-closed priority validation; out-of-range is never clamped
    fn validate(&self, prio: i32) -> Result<()> {
        if prio < self.prio_min() || prio > self.prio_max() {
            return Err(Error::InvalidPriority {
                value: prio,
                min: self.prio_min(),
                max: self.prio_max(),
            });
        }
        Ok(())
    }
}

/// SCHED_FIFO / SCHED_RR band
pub struct FifoClass;

impl SchedClass for FifoClass {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn weight(&self) -> i32 {
        2 * CLASS_WEIGHT_FACTOR
    }

    fn prio_min(&self) -> i32 {
        1
    }

    fn prio_max(&self) -> i32 {
        99
    }
}

/// Weak band: below all FIFO priorities
pub struct WeakClass;

impl SchedClass for WeakClass {
    fn name(&self) -> &'static str {
        "weak"
    }

    fn weight(&self) -> i32 {
        CLASS_WEIGHT_FACTOR
    }

    fn prio_min(&self) -> i32 {
        0
    }

    fn prio_max(&self) -> i32 {
        99
    }
}

/// Idle band: a single priority below everything
pub struct IdleClass;

impl SchedClass for IdleClass {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn weight(&self) -> i32 {
        0
    }

    fn prio_min(&self) -> i32 {
        0
    }

    fn prio_max(&self) -> i32 {
        0
    }
}

static FIFO_CLASS: FifoClass = FifoClass;
static WEAK_CLASS: WeakClass = WeakClass;
static IDLE_CLASS: IdleClass = IdleClass;

/// Class implementing a policy
pub fn class_of(policy: Policy) -> &'static dyn SchedClass {
    match policy {
        Policy::Fifo | Policy::RoundRobin => &FIFO_CLASS,
        Policy::Weak => &WEAK_CLASS,
        Policy::Idle => &IDLE_CLASS,
    }
}

/// Weighted priority: the ordering key used by every ready queue
pub fn weighted_prio(class: &dyn SchedClass, prio: i32) -> i32 {
    prio + class.weight()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bands_do_not_overlap() {
        let fifo_floor = weighted_prio(class_of(Policy::Fifo), 1);
        let weak_ceiling = weighted_prio(class_of(Policy::Weak), 99);
        let idle = weighted_prio(class_of(Policy::Idle), 0);
        assert!(fifo_floor > weak_ceiling);
        assert!(weak_ceiling > idle);
    }

    #[test]
    fn test_fail_closed_validation() {
        let fifo = class_of(Policy::Fifo);
        assert!(fifo.validate(1).is_ok());
        assert!(fifo.validate(99).is_ok());
        assert_eq!(
            fifo.validate(0).unwrap_err(),
            Error::InvalidPriority { value: 0, min: 1, max: 99 }
        );
        assert!(fifo.validate(100).is_err());
    }

    #[test]
    fn test_round_robin_is_fifo_with_quantum() {
        assert_eq!(class_of(Policy::RoundRobin).name(), "fifo");
        assert!(Policy::RoundRobin.timesliced());
        assert!(!Policy::Fifo.timesliced());
    }
}
