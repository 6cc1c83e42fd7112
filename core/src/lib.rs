// src/lib.rs
// Out-of-band real-time co-scheduler core.
#![no_std]

//! # tandem-core
//!
//! A dual-kernel real-time co-scheduler core: a secondary, latency-
//! deterministic thread scheduler that runs alongside a general-purpose
//! ("in-band") kernel and services out-of-band real-time threads with
//! bounded-latency scheduling, per-CPU timers on independent time bases, and
//! a controlled migration path between the two execution stages.
//!
//! The subsystem is an explicit [`Core`] value: clock registry, timer arena,
//! thread arena, wait channels and one runqueue per CPU, each behind its own
//! lock. Hardware and the in-band kernel are reached through the
//! [`platform::Platform`] seam; telemetry is emitted through the `log` facade
//! and never drives state.
//!
//! Entry points that can trigger local rescheduling take the executing CPU as
//! an explicit `caller_cpu` argument: a library has no claim on kernel TLS,
//! so the embedder says which CPU is running the call.

extern crate alloc;

pub mod cpu;
pub mod error;
pub mod noprobe;
pub mod platform;
pub mod scheduler;
pub mod stat;
pub mod sync;
pub mod time;

pub use cpu::{CpuMask, PerCpu, MAX_CPUS};
pub use error::{Error, Result};
pub use platform::{InbandSignal, NullPlatform, Platform, PlatformEvent, RecordingPlatform};
pub use scheduler::class::{Policy, SchedClass};
pub use scheduler::stage::{InbandCause, Stage};
pub use scheduler::thread::{ThreadAttr, ThreadId, ThreadInfo, ThreadState};
pub use stat::StatsSnapshot;
pub use sync::wait_queue::{WaitPolicy, WaitQueueId, WakeSelector};
pub use time::{
    ClockDriver, ClockId, Duration, ManualClock, Timeout, TimerCallback, TimerHandler, TimerId,
    TimerState, Timestamp,
};

use alloc::sync::Arc;
use core::sync::atomic::AtomicU64;
use spin::Mutex;

use crate::noprobe::NoProbeList;
use crate::scheduler::rq::RunQueue;
use crate::scheduler::thread::ThreadArena;
use crate::sync::wait_queue::WaitArena;
use crate::time::clock::ClockRegistry;
use crate::time::timer::TimerArena;

/// Upper bound on names entering the core (clock, thread, timer, wait-queue
/// names); longer inputs are truncated, never copied at caller-supplied
/// length.
pub const MAX_NAME_LEN: usize = 32;

/// Bounded name string
pub type Name = heapless::String<MAX_NAME_LEN>;

/// Truncate `s` into a bounded name at a character boundary
pub(crate) fn bounded_name(s: &str) -> Name {
    let mut out = Name::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// The co-scheduler subsystem.
///
/// Owns every arena and per-CPU structure; embedders (and tests) create
/// independent cores. The built-in monotonic clock is registered at
/// construction, backed by a [`ManualClock`] the embedder advances (a
/// hardware time source registers its own driver via
/// [`Core::register_clock`]).
pub struct Core {
    nr_cpus: usize,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) clocks: ClockRegistry,
    pub(crate) timers: TimerArena,
    pub(crate) threads: ThreadArena,
    pub(crate) wchans: WaitArena,
    pub(crate) rqs: PerCpu<Mutex<RunQueue>>,
    pub(crate) monotonic: ClockId,
    mono_driver: Arc<ManualClock>,
    noprobe: NoProbeList,
    pub(crate) wd_ns: AtomicU64,
}

impl Core {
    /// Build a core for `nr_cpus` CPUs with no platform attached
    pub fn new(nr_cpus: usize) -> Self {
        Self::with_platform(nr_cpus, Arc::new(NullPlatform))
    }

    /// Build a core wired to a platform (IPIs, tick programming, in-band
    /// kernel notifications)
    pub fn with_platform(nr_cpus: usize, platform: Arc<dyn Platform>) -> Self {
        let nr_cpus = nr_cpus.clamp(1, MAX_CPUS);
        let mono_driver = Arc::new(ManualClock::new());
        let mut core = Self {
            nr_cpus,
            platform,
            clocks: ClockRegistry::new(),
            timers: TimerArena::new(),
            threads: ThreadArena::new(),
            wchans: WaitArena::new(),
            rqs: PerCpu::new(nr_cpus, |cpu| Mutex::new(RunQueue::new(cpu))),
            monotonic: ClockId(0),
            mono_driver: mono_driver.clone(),
            noprobe: NoProbeList::new(),
            wd_ns: AtomicU64::new(0),
        };
        // The registry is empty, so the built-in name cannot collide.
        let mono = core
            .register_clock("monotonic", mono_driver)
            .expect("fresh clock registry");
        core.monotonic = mono;

        // Per-CPU service timers: round-robin quantum and oob watchdog.
        for cpu in 0..nr_cpus {
            let rrb = core.create_timer("rrb", TimerHandler::Roundrobin);
            let wd = core.create_timer("wdog", TimerHandler::Watchdog);
            let mut rq = core.rqs.get(cpu).lock();
            rq.rrb_timer = Some(rrb);
            rq.wd_timer = Some(wd);
        }
        log::info!("core: {} cpu(s) online", nr_cpus);
        core
    }

    /// Number of CPUs this core schedules
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// The built-in monotonic clock
    pub fn monotonic(&self) -> ClockId {
        self.monotonic
    }

    /// Advance the built-in monotonic clock's manual driver
    pub fn advance_monotonic(&self, d: Duration) {
        self.mono_driver.advance(d);
    }

    /// Protected code-range registry for trap/interrupt entry sequences
    pub fn noprobe(&self) -> &NoProbeList {
        &self.noprobe
    }

    /// One tick on `cpu`: process due monotonic timers, then run the
    /// rescheduling pass if one was requested. Returns the number of timers
    /// fired.
    pub fn tick(&self, cpu: usize) -> Result<u32> {
        let fired = self.process_expiries(self.monotonic, cpu)?;
        self.schedule(cpu);
        Ok(fired)
    }

    pub(crate) fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu < self.nr_cpus {
            Ok(())
        } else {
            Err(Error::InvalidCpu { cpu })
        }
    }

    /// Mask of all configured CPUs
    pub(crate) fn online_mask(&self) -> CpuMask {
        let mut mask = CpuMask::empty();
        for cpu in 0..self.nr_cpus {
            mask.set(cpu);
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_bring_up() {
        let core = Core::new(4);
        assert_eq!(core.nr_cpus(), 4);
        for cpu in 0..4 {
            assert!(core.cpu_is_idle(cpu));
            assert!(core.current(cpu).is_none());
        }
        assert!(core.clock_gettime(core.monotonic()).unwrap() == Timestamp::ZERO);
    }

    #[test]
    fn test_nr_cpus_clamped() {
        assert_eq!(Core::new(0).nr_cpus(), 1);
        assert_eq!(Core::new(1000).nr_cpus(), MAX_CPUS);
    }

    #[test]
    fn test_bounded_names_truncate() {
        let long = "a-name-well-beyond-the-thirty-two-byte-cap-of-the-core";
        let name = bounded_name(long);
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert!(long.starts_with(name.as_str()));
    }
}
