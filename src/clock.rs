use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Wall-clock source in Unix epoch seconds
///
/// Heartbeat freshness and timeout deadlines are computed against the
/// timestamps embedded in heartbeat payloads, so they need wall time rather
/// than a monotonic instant.
pub trait Clock: Send + Sync {
    fn now_epoch(&self) -> i64;
}

/// Production clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Manually driven clock for tests and replay
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_epoch: i64) -> Self {
        Self {
            now: AtomicI64::new(start_epoch),
        }
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn set(&self, epoch: i64) {
        self.now.store(epoch, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_700_000_000);
        clock.advance(30);
        assert_eq!(clock.now_epoch(), 1_700_000_030);
        clock.set(5);
        assert_eq!(clock.now_epoch(), 5);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_epoch() > 1_577_836_800);
    }
}
