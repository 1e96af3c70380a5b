//! Cumulative pool counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot of the pool's cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolStatistics {
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_errors: u64,
    pub slow_acquisitions: u64,
    pub acquire_timeouts: u64,
    /// Mean time spent in `acquire`, in milliseconds.
    pub average_acquire_ms: f64,
}

/// Lock-free counters shared by the pool and every connection it hands out.
#[derive(Debug, Default)]
pub(crate) struct PoolStats {
    acquired: AtomicU64,
    released: AtomicU64,
    errors: AtomicU64,
    slow: AtomicU64,
    timeouts: AtomicU64,
    acquire_micros: AtomicU64,
    waiting: AtomicU32,
}

impl PoolStats {
    pub(crate) fn record_acquire(&self, elapsed: Duration, slow: bool) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.acquire_micros.fetch_add(micros, Ordering::Relaxed);
        if slow {
            self.slow.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.record_error();
    }

    pub(crate) fn waiting(&self) -> u32 {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Marks the caller as blocked in `acquire` until the guard drops.
    pub(crate) fn enter_wait(&self) -> WaitGuard<'_> {
        self.waiting.fetch_add(1, Ordering::Relaxed);
        WaitGuard { stats: self }
    }

    pub(crate) fn snapshot(&self) -> PoolStatistics {
        let acquired = self.acquired.load(Ordering::Relaxed);
        let micros = self.acquire_micros.load(Ordering::Relaxed);
        let average_acquire_ms = if acquired == 0 {
            0.0
        } else {
            micros as f64 / acquired as f64 / 1_000.0
        };

        PoolStatistics {
            total_acquired: acquired,
            total_released: self.released.load(Ordering::Relaxed),
            total_errors: self.errors.load(Ordering::Relaxed),
            slow_acquisitions: self.slow.load(Ordering::Relaxed),
            acquire_timeouts: self.timeouts.load(Ordering::Relaxed),
            average_acquire_ms,
        }
    }

    /// Zeroes the cumulative counters. The live `waiting` gauge is untouched.
    pub(crate) fn reset(&self) {
        for counter in [
            &self.acquired,
            &self.released,
            &self.errors,
            &self.slow,
            &self.timeouts,
            &self.acquire_micros,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

pub(crate) struct WaitGuard<'a> {
    stats: &'a PoolStats,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.stats.waiting.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_latency_is_computed_from_totals() {
        let stats = PoolStats::default();
        stats.record_acquire(Duration::from_millis(10), false);
        stats.record_acquire(Duration::from_millis(30), true);

        let snap = stats.snapshot();
        assert_eq!(snap.total_acquired, 2);
        assert_eq!(snap.slow_acquisitions, 1);
        assert!((snap.average_acquire_ms - 20.0).abs() < 0.001);
    }

    #[test]
    fn reset_zeroes_counters_but_not_waiters() {
        let stats = PoolStats::default();
        let _guard = stats.enter_wait();
        stats.record_acquire(Duration::from_millis(5), false);
        stats.record_release();
        stats.record_timeout();

        stats.reset();
        assert_eq!(stats.snapshot(), PoolStatistics::default());
        assert_eq!(stats.waiting(), 1);
    }

    #[test]
    fn wait_guard_decrements_on_drop() {
        let stats = PoolStats::default();
        {
            let _a = stats.enter_wait();
            let _b = stats.enter_wait();
            assert_eq!(stats.waiting(), 2);
        }
        assert_eq!(stats.waiting(), 0);
    }
}
