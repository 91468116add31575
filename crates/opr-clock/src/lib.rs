//! Wall time in UTC milliseconds, with a fake implementation for tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time as a source of UTC milliseconds.
///
/// Implementations are not required to be monotonic across processes, but
/// every call from a single handle must return a non-decreasing value.
pub trait Clock: Send + Sync {
    fn now_utc_ms(&self) -> i64;
}

/// A `Clock` backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc_ms(&self) -> i64 {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time is before the unix epoch");
        dur.as_millis() as i64
    }
}

/// A settable clock for deterministic tests. `now_utc_ms` never goes
/// backwards: setting a time earlier than the current value is a no-op.
#[derive(Debug, Default)]
pub struct FakeClock(AtomicI64);

impl FakeClock {
    pub fn new(start_utc_ms: i64) -> Self {
        Self(AtomicI64::new(start_utc_ms))
    }

    /// Advances the clock to `t`, ignoring the call if `t` is in the past.
    pub fn set_time(&self, t: i64) {
        self.0.fetch_max(t, Ordering::SeqCst);
    }

    /// Advances the clock by `millis`.
    pub fn advance(&self, millis: i64) -> i64 {
        self.0.fetch_add(millis, Ordering::SeqCst) + millis
    }
}

impl Clock for FakeClock {
    fn now_utc_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}
