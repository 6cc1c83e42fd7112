//! Clock abstraction
//!
//! Named monotonic time sources. Each registered clock owns one ordered timer
//! base per CPU; changing a clock's time base re-evaluates its queued timers
//! (their expiries are fixed points in the clock's frame, so a backward step
//! makes queued timers newly due) and reprograms the per-CPU next shot.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use crate::cpu::PerCpu;
use crate::error::{Error, Result};
use crate::time::timer::TimerBase;
use crate::time::{Duration, Timestamp};
use crate::{bounded_name, Core, Name};

/// Stable clock identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockId(pub u64);

/// Time-source driver behind a registered clock.
///
/// Device drivers that provide a hardware clock implement this; the defaults
/// make the clock read-only (`settime`/`adjtime` fail closed).
pub trait ClockDriver: Send + Sync {
    /// Current reading of this time source
    fn now(&self) -> Timestamp;

    /// Granularity of the source
    fn resolution(&self) -> Duration {
        Duration::from_ns(1)
    }

    /// Step the time base to `t`
    fn set(&self, _t: Timestamp) -> Result<()> {
        Err(Error::NotSettable)
    }

    /// Apply a signed nanosecond adjustment to the time base
    fn adjust(&self, _offset_ns: i64) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Whether `set` is supported
    fn settable(&self) -> bool {
        false
    }
}

/// Driver advanced explicitly by the embedder; backs the built-in monotonic
/// clock and simulated time in tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    ns: AtomicU64,
}

impl ManualClock {
    pub const fn new() -> Self {
        Self {
            ns: AtomicU64::new(0),
        }
    }

    /// Move the reading forward
    pub fn advance(&self, d: Duration) {
        self.ns.fetch_add(d.as_ns(), Ordering::Relaxed);
    }
}

impl ClockDriver for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_ns(self.ns.load(Ordering::Relaxed))
    }

    fn set(&self, t: Timestamp) -> Result<()> {
        self.ns.store(t.as_ns(), Ordering::Relaxed);
        Ok(())
    }

    fn adjust(&self, offset_ns: i64) -> Result<()> {
        let _ = self
            .ns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(Timestamp::from_ns(cur).offset(offset_ns).as_ns())
            });
        Ok(())
    }

    fn settable(&self) -> bool {
        true
    }
}

/// A registered clock: driver plus its per-CPU timer bases
pub(crate) struct Clock {
    pub(crate) id: ClockId,
    pub(crate) name: Name,
    pub(crate) driver: Arc<dyn ClockDriver>,
    pub(crate) bases: PerCpu<Mutex<TimerBase>>,
}

impl Clock {
    pub(crate) fn now(&self) -> Timestamp {
        self.driver.now()
    }

    pub(crate) fn base(&self, cpu: usize) -> &Mutex<TimerBase> {
        self.bases.get(cpu)
    }

    fn has_queued_timers(&self) -> bool {
        self.bases.iter().any(|base| !base.lock().q.is_empty())
    }
}

struct RegistryInner {
    clocks: HashMap<u64, Arc<Clock>>,
    by_name: HashMap<Name, u64>,
}

/// Registry of live clocks, keyed by id and by name
pub(crate) struct ClockRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

impl ClockRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                clocks: HashMap::new(),
                by_name: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn get(&self, id: ClockId) -> Result<Arc<Clock>> {
        self.inner
            .lock()
            .clocks
            .get(&id.0)
            .cloned()
            .ok_or(Error::InvalidClock)
    }
}

impl Core {
    /// Register a named clock backed by `driver`.
    ///
    /// Fails with `DuplicateName` if a clock with that name already exists;
    /// nothing is registered in that case.
    pub fn register_clock(&self, name: &str, driver: Arc<dyn ClockDriver>) -> Result<ClockId> {
        let name = bounded_name(name);
        let mut inner = self.clocks.inner.lock();
        if inner.by_name.contains_key(&name) {
            return Err(Error::DuplicateName);
        }
        let id = ClockId(self.clocks.next_id.fetch_add(1, Ordering::Relaxed));
        let clock = Arc::new(Clock {
            id,
            name: name.clone(),
            driver,
            bases: PerCpu::new(self.nr_cpus, |_| Mutex::new(TimerBase::new())),
        });
        inner.clocks.insert(id.0, clock);
        inner.by_name.insert(name, id.0);
        log::debug!("clock {}: registered", id.0);
        Ok(id)
    }

    /// Unregister a clock; fails with `Busy` while any timer is queued on it
    pub fn unregister_clock(&self, id: ClockId) -> Result<()> {
        let mut inner = self.clocks.inner.lock();
        let clock = inner.clocks.get(&id.0).ok_or(Error::InvalidClock)?;
        if clock.has_queued_timers() {
            return Err(Error::Busy);
        }
        let name = clock.name.clone();
        inner.clocks.remove(&id.0);
        inner.by_name.remove(&name);
        log::debug!("clock {}: unregistered", id.0);
        Ok(())
    }

    /// Resolution of the clock
    pub fn clock_getres(&self, id: ClockId) -> Result<Duration> {
        Ok(self.clocks.get(id)?.driver.resolution())
    }

    /// Current reading of the clock
    pub fn clock_gettime(&self, id: ClockId) -> Result<Timestamp> {
        Ok(self.clocks.get(id)?.now())
    }

    /// Step the clock's time base.
    ///
    /// Queued timers keep their absolute expiries, so a backward step makes
    /// some of them newly due; the per-CPU next shot is reprogrammed and the
    /// due timers fire on the next expiry pass.
    pub fn clock_settime(&self, id: ClockId, t: Timestamp) -> Result<()> {
        let clock = self.clocks.get(id)?;
        clock.driver.set(t)?;
        log::debug!("clock {}: stepped to {}ns", id.0, t.as_ns());
        self.resync_clock(&clock);
        Ok(())
    }

    /// Apply a stepped or slewed adjustment to the clock's time base
    pub fn clock_adjtime(&self, id: ClockId, offset_ns: i64) -> Result<()> {
        let clock = self.clocks.get(id)?;
        clock.driver.adjust(offset_ns)?;
        log::debug!("clock {}: adjusted by {}ns", id.0, offset_ns);
        self.resync_clock(&clock);
        Ok(())
    }

    /// Look up the name a clock was registered under
    pub fn clock_name(&self, id: ClockId) -> Result<Name> {
        Ok(self.clocks.get(id)?.name.clone())
    }

    pub(crate) fn clock(&self, id: ClockId) -> Result<Arc<Clock>> {
        self.clocks.get(id)
    }

    /// Reprogram every CPU's next shot after the clock's frame moved
    fn resync_clock(&self, clock: &Clock) {
        log::trace!(
            "clock {} ({}): resyncing timer bases",
            clock.id.0,
            clock.name.as_str()
        );
        for cpu in 0..self.nr_cpus {
            let base = clock.base(cpu).lock();
            match base.q.first() {
                Some(head) => self.platform.program_shot(cpu, head.expiry),
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Timestamp::ZERO);
        clock.advance(Duration::from_us(5));
        assert_eq!(clock.now().as_us(), 5);
        clock.set(Timestamp::from_ns(100)).unwrap();
        clock.adjust(-40).unwrap();
        assert_eq!(clock.now().as_ns(), 60);
        assert!(clock.settable());
    }

    #[test]
    fn test_register_duplicate_name() {
        let core = Core::new(1);
        let driver = Arc::new(ManualClock::new());
        core.register_clock("dev0", driver.clone()).unwrap();
        assert_eq!(
            core.register_clock("dev0", driver).unwrap_err(),
            Error::DuplicateName
        );
    }

    #[test]
    fn test_unregister_unknown() {
        let core = Core::new(1);
        assert_eq!(
            core.unregister_clock(ClockId(999)).unwrap_err(),
            Error::InvalidClock
        );
    }

    #[test]
    fn test_settime_requires_settable_driver() {
        struct FixedClock;
        impl ClockDriver for FixedClock {
            fn now(&self) -> Timestamp {
                Timestamp::ZERO
            }
        }
        let core = Core::new(1);
        let id = core.register_clock("fixed", Arc::new(FixedClock)).unwrap();
        assert_eq!(
            core.clock_settime(id, Timestamp::from_ns(1)).unwrap_err(),
            Error::NotSettable
        );
        assert_eq!(core.clock_adjtime(id, 5).unwrap_err(), Error::NotSupported);
    }
}
