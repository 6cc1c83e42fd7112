//! Platform seam - the external collaborators of the core
//!
//! The scheduler drives its hardware and in-band-kernel collaborators through
//! this trait: inter-processor interrupts for remote rescheduling, per-CPU
//! next-deadline programming, and the narrow notification interface into the
//! general-purpose kernel. Everything here is fire-and-forget; the core never
//! blocks on or branches upon a platform call succeeding.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::scheduler::thread::ThreadId;
use crate::time::Timestamp;

/// Signal-style notification delivered to a demoted thread's in-band side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InbandSignal {
    /// The oob watchdog expired; the thread was forcibly demoted
    Watchdog,
    /// The thread faulted while executing out-of-band code
    Fault,
}

/// Collaborator interface consumed by the core
pub trait Platform: Send + Sync {
    /// Kick a remote CPU so it runs a reschedule pass at its next safe point
    fn send_ipi(&self, _cpu: usize) {}

    /// Program the per-CPU next-deadline timer event
    fn program_shot(&self, _cpu: usize, _deadline: Timestamp) {}

    /// Cancel the per-CPU next-deadline event (no timers queued)
    fn stop_shot(&self, _cpu: usize) {}

    /// Suspend the thread's in-band execution context (it is now oob-owned)
    fn inband_suspend(&self, _thread: ThreadId) {}

    /// Resume the thread's in-band execution context (handed back in-band)
    fn inband_resume(&self, _thread: ThreadId) {}

    /// Deliver a POSIX-style signal/fault notification in-band
    fn deliver_signal(&self, _thread: ThreadId, _sig: InbandSignal) {}
}

/// Platform that drops every notification
#[derive(Debug, Default)]
pub struct NullPlatform;

impl Platform for NullPlatform {}

/// Everything the core told the platform, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    Ipi(usize),
    Shot { cpu: usize, deadline: Timestamp },
    ShotStopped(usize),
    InbandSuspend(ThreadId),
    InbandResume(ThreadId),
    Signal(ThreadId, InbandSignal),
}

/// Recording platform for tests and bring-up diagnostics
#[derive(Default)]
pub struct RecordingPlatform {
    events: Mutex<Vec<PlatformEvent>>,
}

impl RecordingPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the recorded events
    pub fn events(&self) -> Vec<PlatformEvent> {
        self.events.lock().clone()
    }

    /// Drain the recorded events
    pub fn take(&self) -> Vec<PlatformEvent> {
        core::mem::take(&mut *self.events.lock())
    }

    /// Count IPIs sent to `cpu`
    pub fn ipis_to(&self, cpu: usize) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, PlatformEvent::Ipi(c) if *c == cpu))
            .count()
    }

    /// Signals delivered to `thread`
    pub fn signals_for(&self, thread: ThreadId) -> Vec<InbandSignal> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                PlatformEvent::Signal(t, sig) if *t == thread => Some(*sig),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: PlatformEvent) {
        self.events.lock().push(event);
    }
}

impl Platform for RecordingPlatform {
    fn send_ipi(&self, cpu: usize) {
        self.record(PlatformEvent::Ipi(cpu));
    }

    fn program_shot(&self, cpu: usize, deadline: Timestamp) {
        self.record(PlatformEvent::Shot { cpu, deadline });
    }

    fn stop_shot(&self, cpu: usize) {
        self.record(PlatformEvent::ShotStopped(cpu));
    }

    fn inband_suspend(&self, thread: ThreadId) {
        self.record(PlatformEvent::InbandSuspend(thread));
    }

    fn inband_resume(&self, thread: ThreadId) {
        self.record(PlatformEvent::InbandResume(thread));
    }

    fn deliver_signal(&self, thread: ThreadId, sig: InbandSignal) {
        self.record(PlatformEvent::Signal(thread, sig));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_platform() {
        let platform = RecordingPlatform::new();
        platform.send_ipi(2);
        platform.send_ipi(2);
        platform.deliver_signal(ThreadId(9), InbandSignal::Watchdog);
        assert_eq!(platform.ipis_to(2), 2);
        assert_eq!(platform.ipis_to(1), 0);
        assert_eq!(platform.signals_for(ThreadId(9)), [InbandSignal::Watchdog]);
        assert_eq!(platform.take().len(), 3);
        assert!(platform.events().is_empty());
    }
}
