//! Time base types for the co-scheduler
//!
//! Nanosecond timestamps and durations with saturating arithmetic, plus the
//! timeout forms accepted by the blocking primitives.

pub mod clock;
pub mod timer;

pub use clock::{ClockDriver, ClockId, ManualClock};
pub use timer::{TimerCallback, TimerHandler, TimerId, TimerState};

use core::ops::{Add, Sub};

/// Point in time on some clock's time base (nanoseconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub const fn from_ns(ns: u64) -> Self {
        Self(ns)
    }

    pub const fn as_ns(&self) -> u64 {
        self.0
    }

    pub const fn as_us(&self) -> u64 {
        self.0 / 1_000
    }

    pub const fn as_ms(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Shift by a signed nanosecond offset, saturating at both ends
    pub fn offset(&self, ns: i64) -> Self {
        if ns >= 0 {
            Self(self.0.saturating_add(ns as u64))
        } else {
            Self(self.0.saturating_sub(ns.unsigned_abs()))
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.0))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_sub(rhs.0))
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Self::Output {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

/// Time span (nanoseconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(pub u64);

impl Duration {
    pub const ZERO: Self = Self(0);

    pub const fn from_ns(ns: u64) -> Self {
        Self(ns)
    }

    pub const fn from_us(us: u64) -> Self {
        Self(us * 1_000)
    }

    pub const fn from_ms(ms: u64) -> Self {
        Self(ms * 1_000_000)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1_000_000_000)
    }

    pub const fn as_ns(&self) -> u64 {
        self.0
    }

    pub const fn as_us(&self) -> u64 {
        self.0 / 1_000
    }

    pub const fn as_ms(&self) -> u64 {
        self.0 / 1_000_000
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Self) -> Self::Output {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Duration {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Self::Output {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

/// Timeout accepted by the blocking primitives.
///
/// `Never` blocks until an explicit wake; the other forms arm a wait timer on
/// the clock the caller passed to `sleep_on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block until woken
    Never,
    /// Deadline relative to the clock's current time
    After(Duration),
    /// Absolute deadline in the clock's frame
    At(Timestamp),
}

impl Timeout {
    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }

    /// Absolute deadline for this timeout given the clock's current reading
    pub fn deadline(&self, now: Timestamp) -> Option<Timestamp> {
        match self {
            Self::Never => None,
            Self::After(d) => Some(now + *d),
            Self::At(t) => Some(*t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_conversions() {
        let dur = Duration::from_ms(1500);
        assert_eq!(dur.as_ms(), 1500);
        assert_eq!(dur.as_us(), 1_500_000);
        assert_eq!(dur.as_ns(), 1_500_000_000);
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::from_ns(1_000);
        assert_eq!((t + Duration::from_ns(500)).as_ns(), 1_500);
        assert_eq!((t - Duration::from_ns(2_000)).as_ns(), 0);
        assert_eq!((Timestamp::from_ns(1_500) - t).as_ns(), 500);
        assert_eq!(t.offset(-400).as_ns(), 600);
    }

    #[test]
    fn test_timeout_deadline() {
        let now = Timestamp::from_ns(100);
        assert_eq!(Timeout::Never.deadline(now), None);
        assert_eq!(
            Timeout::After(Duration::from_ns(50)).deadline(now),
            Some(Timestamp::from_ns(150))
        );
        assert_eq!(
            Timeout::At(Timestamp::from_ns(80)).deadline(now),
            Some(Timestamp::from_ns(80))
        );
    }
}
