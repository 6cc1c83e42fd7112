//! Lightweight event counters for scheduler accounting

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Relaxed monotonic event counter
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Per-thread accounting
#[derive(Debug, Default)]
pub struct ThreadStats {
    /// Context switches into this thread (out-of-band)
    pub csw: Counter,
    /// Switches to the in-band stage
    pub isw: Counter,
    /// Remote wakeups (woken from another CPU)
    pub rwa: Counter,
    /// Wait timeouts taken
    pub timeouts: Counter,
}

impl ThreadStats {
    pub const fn new() -> Self {
        Self {
            csw: Counter::new(),
            isw: Counter::new(),
            rwa: Counter::new(),
            timeouts: Counter::new(),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            csw: self.csw.get(),
            isw: self.isw.get(),
            rwa: self.rwa.get(),
            timeouts: self.timeouts.get(),
        }
    }
}

/// Point-in-time copy of a thread's accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub csw: u64,
    pub isw: u64,
    pub rwa: u64,
    pub timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::new();
        c.inc();
        c.add(3);
        assert_eq!(c.get(), 4);
    }
}
