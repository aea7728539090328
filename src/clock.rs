// =============================================================================
// Clock — wall-clock source for candle closure and range clamping
// =============================================================================
//
// Scheduling (sleeps, intervals, backoff) goes through tokio time so tests can
// pause it. "What time is it on the exchange" goes through this trait so tests
// can pin it.
// =============================================================================

#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds.
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually driven clock.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

#[cfg(test)]
impl FixedClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
