use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Thread-safe wall-clock time source.
///
/// All bucket state is expressed as absolute nanosecond timestamps, so the
/// clock is the single seam through which "now" enters the limiter. Tests
/// inject a [`FakeClock`] instead of sleeping.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in nanoseconds since the UNIX epoch.
    fn now_nanos(&self) -> i64;
}

/// Clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX)
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct FakeClock {
    nanos: AtomicI64,
}

impl FakeClock {
    pub fn new(nanos: i64) -> Self {
        Self {
            nanos: AtomicI64::new(nanos),
        }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let delta = i64::try_from(delta.as_nanos()).unwrap_or(i64::MAX);
        self.nanos.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_non_decreasing() {
        let clock = SystemClock;
        let first = clock.now_nanos();
        let second = clock.now_nanos();
        assert!(second >= first);
    }

    #[test]
    fn fake_clock_advances() {
        let clock = FakeClock::new(100);
        assert_eq!(clock.now_nanos(), 100);

        clock.advance(Duration::from_nanos(50));
        assert_eq!(clock.now_nanos(), 150);

        clock.set(10);
        assert_eq!(clock.now_nanos(), 10);
    }

    #[test]
    fn trait_object_usage() {
        let clock: Box<dyn Clock> = Box::new(SystemClock);
        let _ = clock.now_nanos();
    }
}
