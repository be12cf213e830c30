// =============================================================================
// Adaptive Rate Limiter — token-bucket gate with adaptive backoff
// =============================================================================
//
// A single shared gate guards every outbound exchange request. Internally it
// tracks a floating-point current rate (tokens/sec), a burst capacity, a
// current token count, a backoff multiplier, and a bounded sliding window of
// recent success/failure outcomes. See spec.md §4.B.
// =============================================================================

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Number of recent outcomes kept in the sliding window.
const OUTCOME_WINDOW: usize = 100;
/// Minimum samples in the window before adaptation kicks in.
const MIN_SAMPLES_FOR_ADAPTATION: usize = 10;

struct Inner {
    base_rate: f64,
    current_rate: f64,
    burst_capacity: f64,
    tokens: f64,
    backoff_multiplier: f64,
    last_refill: Instant,
    outcomes: VecDeque<bool>,
}

/// Shared, lock-guarded token-bucket rate limiter.
pub struct AdaptiveRateLimiter {
    inner: Mutex<Inner>,
}

/// Serializable snapshot of the limiter's current state, for logging or
/// telemetry surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    pub current_rate: f64,
    pub backoff_multiplier: f64,
    pub tokens_available: f64,
    pub success_fraction: Option<f64>,
    pub sample_count: usize,
}

impl AdaptiveRateLimiter {
    /// Create a new limiter. `base_rate` is tokens/sec at steady state,
    /// `burst_capacity` caps how many tokens can accrue while idle.
    pub fn new(base_rate: f64, burst_capacity: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                base_rate,
                current_rate: base_rate,
                burst_capacity,
                tokens: burst_capacity,
                backoff_multiplier: 1.0,
                last_refill: Instant::now(),
                outcomes: VecDeque::with_capacity(OUTCOME_WINDOW),
            }),
        }
    }

    /// Acquire a single token, sleeping (possibly repeatedly) until one is
    /// available. Returns the total time spent waiting.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock();
                inner.refill();
                if inner.tokens >= 1.0 {
                    inner.tokens -= 1.0;
                    debug!(
                        tokens_remaining = inner.tokens,
                        rate = inner.current_rate,
                        "rate limiter token acquired"
                    );
                    return;
                }
                let deficit = 1.0 - inner.tokens;
                (deficit / inner.current_rate) * inner.backoff_multiplier
            };
            tokio::time::sleep(std::time::Duration::from_secs_f64(wait.max(0.0))).await;
        }
    }

    /// Record the outcome of a completed request ("success" means the API
    /// responded without a transient error within its soft deadline) and
    /// re-adapt the rate/multiplier once enough samples have accumulated.
    pub fn record_outcome(&self, success: bool) {
        let mut inner = self.inner.lock();
        inner.outcomes.push_back(success);
        if inner.outcomes.len() > OUTCOME_WINDOW {
            inner.outcomes.pop_front();
        }
        inner.adapt();
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let inner = self.inner.lock();
        let success_fraction = inner.success_fraction();
        RateLimiterSnapshot {
            current_rate: inner.current_rate,
            backoff_multiplier: inner.backoff_multiplier,
            tokens_available: inner.tokens,
            success_fraction,
            sample_count: inner.outcomes.len(),
        }
    }

    /// Success fraction over the last-100 outcome window, used by the
    /// strategy's API-success spread multiplier (spec.md §4.G).
    pub fn success_fraction(&self) -> Option<f64> {
        self.inner.lock().success_fraction()
    }
}

impl Inner {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.current_rate).min(self.burst_capacity);
    }

    fn success_fraction(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let successes = self.outcomes.iter().filter(|&&o| o).count();
        Some(successes as f64 / self.outcomes.len() as f64)
    }

    fn adapt(&mut self) {
        if self.outcomes.len() < MIN_SAMPLES_FOR_ADAPTATION {
            return;
        }
        let fraction = self.success_fraction().unwrap_or(1.0);
        if fraction > 0.95 {
            self.current_rate = (self.current_rate * 1.05).min(self.base_rate * 1.5);
            self.backoff_multiplier = (self.backoff_multiplier * 0.9).max(1.0);
        } else if fraction < 0.70 {
            self.current_rate = (self.current_rate * 0.9).max(self.base_rate * 0.3);
            self.backoff_multiplier = (self.backoff_multiplier * 1.2).min(5.0);
        } else {
            self.current_rate = (self.current_rate + self.base_rate) / 2.0;
            self.backoff_multiplier = (self.backoff_multiplier * 0.95).max(1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fewer_than_ten_samples_disables_adaptation() {
        let limiter = AdaptiveRateLimiter::new(10.0, 10.0);
        for _ in 0..9 {
            limiter.record_outcome(false);
        }
        let snap = limiter.snapshot();
        assert_eq!(snap.current_rate, 10.0);
        assert_eq!(snap.backoff_multiplier, 1.0);
    }

    #[test]
    fn high_success_fraction_raises_rate_and_lowers_multiplier() {
        let limiter = AdaptiveRateLimiter::new(10.0, 10.0);
        for _ in 0..20 {
            limiter.record_outcome(true);
        }
        let snap = limiter.snapshot();
        assert!(snap.current_rate > 10.0);
        assert!(snap.current_rate <= 15.0);
        assert_eq!(snap.backoff_multiplier, 1.0);
    }

    #[test]
    fn low_success_fraction_lowers_rate_and_raises_multiplier() {
        let limiter = AdaptiveRateLimiter::new(10.0, 10.0);
        for _ in 0..20 {
            limiter.record_outcome(false);
        }
        let snap = limiter.snapshot();
        assert!(snap.current_rate < 10.0);
        assert!(snap.current_rate >= 3.0);
        assert!(snap.backoff_multiplier > 1.0);
        assert!(snap.backoff_multiplier <= 5.0);
    }

    #[test]
    fn rate_never_drops_below_floor_across_many_failures() {
        let limiter = AdaptiveRateLimiter::new(10.0, 10.0);
        for _ in 0..500 {
            limiter.record_outcome(false);
        }
        let snap = limiter.snapshot();
        assert!(snap.current_rate >= 3.0 - 1e-9);
        assert!(snap.backoff_multiplier <= 5.0 + 1e-9);
    }

    #[tokio::test]
    async fn acquire_never_exceeds_burst_capacity_instantly() {
        let limiter = AdaptiveRateLimiter::new(5.0, 3.0);
        // Burst capacity is 3: the first three acquires should return
        // immediately (no sleep needed), the fourth must wait.
        for _ in 0..3 {
            tokio::time::timeout(std::time::Duration::from_millis(50), limiter.acquire())
                .await
                .expect("burst tokens should be available immediately");
        }
        let snap = limiter.snapshot();
        assert!(snap.tokens_available < 1.0);
    }
}
