// =============================================================================
// Backoff Policy — capped exponential delay with uniform jitter
// =============================================================================
//
//   delay(attempt) = min(max_backoff, base_backoff * 2^attempt)
//                    + uniform(0, jitter_ceiling)
//
// Used by the range fetcher (bounded retry of transient page failures) and by
// the stream supervisor (reconnects). Sleeps are cancellable.
// =============================================================================

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

fn default_base_ms() -> u64 {
    600
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    6
}

/// Tunable reconnect / retry timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,

    #[serde(default = "default_max_ms")]
    pub max_ms: u64,

    /// Upper bound of the uniform jitter added on top of the capped delay.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// Attempts allowed for bounded retries (range fetches). Streams ignore it.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
            jitter_ms: default_jitter_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl BackoffPolicy {
    /// Capped exponential part of the delay, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        // 2^attempt overflows u64 past 63; anything that large is capped anyway.
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let ms = self.base_ms.saturating_mul(factor).min(self.max_ms);
        Duration::from_millis(ms)
    }

    /// Full delay for `attempt` including a fresh jitter sample.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }

    /// Upper bound any computed delay can reach.
    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.max_ms + self.jitter_ms)
    }
}

/// Sleep for `delay` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_ms: 1_000,
            max_ms: 30_000,
            jitter_ms: 500,
            max_attempts: 5,
        }
    }

    #[test]
    fn delays_never_exceed_cap_plus_jitter() {
        let p = policy();
        for attempt in 0..100 {
            for _ in 0..20 {
                assert!(p.delay(attempt) <= p.ceiling());
            }
        }
    }

    #[test]
    fn base_delay_non_decreasing_until_cap() {
        let p = policy();
        let mut prev = Duration::ZERO;
        for attempt in 0..40 {
            let d = p.base_delay(attempt);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            prev = d;
        }
        assert_eq!(p.base_delay(0), Duration::from_secs(1));
        assert_eq!(p.base_delay(4), Duration::from_secs(16));
        assert_eq!(p.base_delay(5), Duration::from_secs(30));
        assert_eq!(p.base_delay(200), Duration::from_secs(30));
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let p = BackoffPolicy {
            jitter_ms: 0,
            ..policy()
        };
        assert_eq!(p.delay(2), Duration::from_secs(4));
    }

    #[test]
    fn policy_deserialises_with_defaults() {
        let p: BackoffPolicy = serde_json::from_str(r#"{ "base_ms": 100 }"#).unwrap();
        assert_eq!(p.base_ms, 100);
        assert_eq!(p.max_ms, 30_000);
        assert_eq!(p.max_attempts, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_cancellable_returns_false_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_cancellable(Duration::from_secs(3600), &cancel).await);

        let live = CancellationToken::new();
        assert!(sleep_cancellable(Duration::from_millis(10), &live).await);
    }
}
