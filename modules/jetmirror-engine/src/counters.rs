use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Event outcome counters, shared by the decoder path, the workers and the
/// supervisor. Relaxed atomics: these are for monitoring, not control flow.
#[derive(Debug, Default)]
pub struct EngineCounters {
    applied: AtomicU64,
    stale: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    decode_failed: AtomicU64,
    ignored: AtomicU64,
    overflowed: AtomicU64,
    tombstones_purged: AtomicU64,
}

impl EngineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failed(&self) {
        self.decode_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.overflowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_purged(&self, n: u64) {
        self.tombstones_purged.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            decode_failed: self.decode_failed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            tombstones_purged: self.tombstones_purged.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub applied: u64,
    pub stale: u64,
    pub failed: u64,
    pub retried: u64,
    pub decode_failed: u64,
    pub ignored: u64,
    pub overflowed: u64,
    pub tombstones_purged: u64,
}

impl CounterSnapshot {
    /// Events that reached a terminal outcome in the apply path.
    pub fn completed(&self) -> u64 {
        self.applied + self.stale + self.failed + self.overflowed
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "applied={} stale={} failed={} retried={} decode_failed={} ignored={} overflowed={} tombstones_purged={}",
            self.applied,
            self.stale,
            self.failed,
            self.retried,
            self.decode_failed,
            self.ignored,
            self.overflowed,
            self.tombstones_purged,
        )
    }
}
