//! Kernel clock
//!
//! Deadlines and the guest tick counter are derived from one nanosecond
//! clock. Tests and the wasm facade use a manual clock so runs are
//! reproducible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Guest tick frequency (19.2 MHz)
pub const TICKS_PER_SECOND: u64 = 19_200_000;

pub enum TimeSource {
    Host(Instant),
    Manual(AtomicU64),
}

impl TimeSource {
    pub fn host() -> Self {
        TimeSource::Host(Instant::now())
    }

    pub fn manual() -> Self {
        TimeSource::Manual(AtomicU64::new(0))
    }

    /// Nanoseconds since the kernel started
    pub fn now(&self) -> u64 {
        match self {
            TimeSource::Host(start) => start.elapsed().as_nanos() as u64,
            TimeSource::Manual(ns) => ns.load(Ordering::Acquire),
        }
    }

    /// Move a manual clock forward; the host clock ignores this
    pub fn advance(&self, ns: u64) {
        if let TimeSource::Manual(now) = self {
            now.fetch_add(ns, Ordering::AcqRel);
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, TimeSource::Manual(_))
    }

    pub fn ticks(&self) -> u64 {
        ns_to_ticks(self.now())
    }
}

pub fn ns_to_ticks(ns: u64) -> u64 {
    (ns as u128 * TICKS_PER_SECOND as u128 / 1_000_000_000) as u64
}

/// Absolute deadline for a relative SVC timeout; negative waits forever
pub fn deadline(now: u64, timeout_ns: i64) -> Option<u64> {
    if timeout_ns < 0 {
        None
    } else {
        Some(now.saturating_add(timeout_ns as u64))
    }
}
