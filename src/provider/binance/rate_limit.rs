// =============================================================================
// Rate-Limit Tracker — request-weight accounting for Binance REST
// =============================================================================
//
// Binance enforces 1200 request weight per minute per IP. We cap ourselves at
// 1000 and read `X-MBX-USED-WEIGHT-1M` after every response. A request that
// would cross the cap is refused locally and surfaced to the caller as a
// transient rate-limit error carrying the time left in the current window.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;
/// Binance weight window.
const WEIGHT_WINDOW: Duration = Duration::from_secs(60);

/// Thread-safe weight tracker shared by every REST call of one provider.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    window_started: Mutex<Instant>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            window_started: Mutex::new(Instant::now()),
        }
    }

    /// Update the counter from the response headers returned by Binance.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        self.record_weight(w);
    }

    fn record_weight(&self, w: u32) {
        let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
        if w < prev {
            // Server-side window rolled over.
            *self.window_started.lock() = Instant::now();
        }
        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = w,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = w, "rate-limit weight updated from header");
    }

    /// `Ok(())` if `weight` more fits under the hard cap, otherwise the time
    /// left until the local window resets.
    pub fn try_acquire(&self, weight: u32) -> Result<(), Duration> {
        {
            let mut started = self.window_started.lock();
            if started.elapsed() >= WEIGHT_WINDOW {
                *started = Instant::now();
                self.used_weight_1m.store(0, Ordering::Relaxed);
            }
        }

        let current = self.used_weight_1m.load(Ordering::Relaxed);
        if current + weight <= WEIGHT_HARD_LIMIT {
            self.used_weight_1m.fetch_add(weight, Ordering::Relaxed);
            return Ok(());
        }

        let remaining = WEIGHT_WINDOW.saturating_sub(self.window_started.lock().elapsed());
        warn!(
            current_weight = current,
            requested_weight = weight,
            hard_limit = WEIGHT_HARD_LIMIT,
            wait_ms = remaining.as_millis() as u64,
            "request blocked — would exceed rate-limit"
        );
        Err(remaining)
    }

    pub fn used_weight(&self) -> u32 {
        self.used_weight_1m.load(Ordering::Relaxed)
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[tokio::test(start_paused = true)]
    async fn blocks_above_hard_limit_until_window_resets() {
        let t = RateLimitTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("995"));
        t.update_from_headers(&headers);

        assert!(t.try_acquire(2).is_ok());
        let wait = t.try_acquire(10).unwrap_err();
        assert!(wait <= WEIGHT_WINDOW);

        tokio::time::advance(WEIGHT_WINDOW).await;
        assert!(t.try_acquire(10).is_ok());
        assert_eq!(t.used_weight(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_garbage_header() {
        let t = RateLimitTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("lots"));
        t.update_from_headers(&headers);
        assert_eq!(t.used_weight(), 0);
    }
}
