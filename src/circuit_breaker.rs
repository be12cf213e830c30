// =============================================================================
// Circuit Breaker — four-state machine driven by health score (spec.md §4.F)
// =============================================================================
//
// Normal -> MinorPause -> MajorCancel -> CriticalShutdown, thresholds
// T_minor > T_major > T_critical on the aggregate health score. Transitions
// are strictly monotone within one evaluation cycle: the breaker never
// silently downgrades severity without a complete recovery above T_minor.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::BreakerState;

/// Thresholds on the aggregate health score (spec.md §4.F defaults).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerThresholds {
    pub minor: f64,
    pub major: f64,
    pub critical: f64,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            minor: 0.6,
            major: 0.4,
            critical: 0.2,
        }
    }
}

/// Outcome of a single evaluation cycle, telling the caller what actions to
/// take (cancel-all on entry to `MajorCancel`, shutdown on entry to
/// `CriticalShutdown`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub entered_major_cancel: bool,
    pub entered_critical_shutdown: bool,
}

/// Four-state circuit breaker guarding the strategy loop.
pub struct CircuitBreaker {
    thresholds: BreakerThresholds,
    state: RwLock<BreakerState>,
    activations: std::sync::atomic::AtomicU64,
    shutdown_requested: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(thresholds: BreakerThresholds) -> Self {
        Self {
            thresholds,
            state: RwLock::new(BreakerState::Normal),
            activations: std::sync::atomic::AtomicU64::new(0),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> BreakerState {
        *self.state.read()
    }

    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Evaluate a fresh aggregate health score and transition to the most
    /// severe state whose threshold the score falls below. Severity may
    /// rise immediately, but only a full recovery above `T_minor` (i.e.
    /// `target == Normal`) is allowed to de-escalate — any other reading
    /// below `T_minor` holds at `max(current, target)`, so the breaker
    /// never silently steps down a partial recovery (spec.md §4.F item 5,
    /// §8).
    pub fn evaluate(&self, aggregate_score: f64) -> Transition {
        let target = if aggregate_score < self.thresholds.critical {
            BreakerState::CriticalShutdown
        } else if aggregate_score < self.thresholds.major {
            BreakerState::MajorCancel
        } else if aggregate_score < self.thresholds.minor {
            BreakerState::MinorPause
        } else {
            BreakerState::Normal
        };

        let mut state = self.state.write();
        let from = *state;
        *state = if target == BreakerState::Normal { target } else { from.max(target) };
        let target = *state;
        drop(state);

        let entered_major_cancel = from != BreakerState::MajorCancel && target == BreakerState::MajorCancel;
        let entered_critical_shutdown =
            from != BreakerState::CriticalShutdown && target == BreakerState::CriticalShutdown;

        if entered_major_cancel {
            self.activations.fetch_add(1, Ordering::SeqCst);
            warn!(aggregate_score, "circuit breaker entered MajorCancel");
        }
        if entered_critical_shutdown {
            self.shutdown_requested.store(true, Ordering::SeqCst);
            warn!(aggregate_score, "circuit breaker entered CriticalShutdown");
        }
        if from != target {
            info!(from = %from, to = %target, aggregate_score, "circuit breaker transition");
        }

        Transition {
            from,
            to: target,
            entered_major_cancel,
            entered_critical_shutdown,
        }
    }

    /// `true` if the strategy should place new quotes at the current state.
    pub fn allows_new_quotes(&self) -> bool {
        self.state() == BreakerState::Normal
    }

    /// `true` if existing orders should be left alone (no forced cancel).
    pub fn allows_existing_orders(&self) -> bool {
        matches!(self.state(), BreakerState::Normal | BreakerState::MinorPause)
    }

    /// Externally triggered escalation: a failed PnL-stop close order
    /// escalates straight to `MajorCancel` regardless of the current
    /// aggregate health score (spec.md §4.G). Never downgrades — if the
    /// breaker is already at `CriticalShutdown` this is a no-op.
    pub fn force_major_cancel(&self, reason: &str) {
        let mut state = self.state.write();
        if *state >= BreakerState::MajorCancel {
            return;
        }
        *state = BreakerState::MajorCancel;
        drop(state);
        self.activations.fetch_add(1, Ordering::SeqCst);
        warn!(reason, "circuit breaker force-escalated to MajorCancel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_score_stays_normal() {
        let cb = CircuitBreaker::new(BreakerThresholds::default());
        let t = cb.evaluate(0.9);
        assert_eq!(t.to, BreakerState::Normal);
    }

    #[test]
    fn score_below_major_enters_major_cancel_and_counts_activation() {
        let cb = CircuitBreaker::new(BreakerThresholds::default());
        let t = cb.evaluate(0.35);
        assert_eq!(t.to, BreakerState::MajorCancel);
        assert!(t.entered_major_cancel);
        assert_eq!(cb.activations(), 1);
    }

    #[test]
    fn score_below_critical_requests_shutdown() {
        let cb = CircuitBreaker::new(BreakerThresholds::default());
        cb.evaluate(0.1);
        assert!(cb.shutdown_requested());
        assert_eq!(cb.state(), BreakerState::CriticalShutdown);
    }

    #[test]
    fn recovery_above_minor_returns_fully_to_normal() {
        let cb = CircuitBreaker::new(BreakerThresholds::default());
        cb.evaluate(0.1);
        assert_eq!(cb.state(), BreakerState::CriticalShutdown);
        cb.evaluate(0.95);
        assert_eq!(cb.state(), BreakerState::Normal);
    }

    #[test]
    fn severity_is_never_downgraded_silently_within_same_reading() {
        let cb = CircuitBreaker::new(BreakerThresholds::default());
        cb.evaluate(0.95);
        let t = cb.evaluate(0.35);
        // one clean jump straight to the severity the score implies, no
        // intermediate states skipped over silently.
        assert_eq!(t.from, BreakerState::Normal);
        assert_eq!(t.to, BreakerState::MajorCancel);
    }

    #[test]
    fn partial_recovery_below_minor_holds_at_major_cancel() {
        let cb = CircuitBreaker::new(BreakerThresholds::default());
        cb.evaluate(0.35);
        assert_eq!(cb.state(), BreakerState::MajorCancel);
        // 0.5 is above T_major (0.4) and below T_minor (0.6), which in
        // isolation implies MinorPause — but this is not a full recovery,
        // so the breaker must hold at MajorCancel rather than step down.
        let t = cb.evaluate(0.5);
        assert_eq!(t.to, BreakerState::MajorCancel);
        assert!(!cb.allows_existing_orders());
    }

    #[test]
    fn full_recovery_above_minor_clears_major_cancel() {
        let cb = CircuitBreaker::new(BreakerThresholds::default());
        cb.evaluate(0.35);
        assert_eq!(cb.state(), BreakerState::MajorCancel);
        let t = cb.evaluate(0.65);
        assert_eq!(t.to, BreakerState::Normal);
    }

    #[test]
    fn force_major_cancel_escalates_and_counts_activation() {
        let cb = CircuitBreaker::new(BreakerThresholds::default());
        cb.force_major_cancel("pnl stop close failed");
        assert_eq!(cb.state(), BreakerState::MajorCancel);
        assert_eq!(cb.activations(), 1);
    }

    #[test]
    fn force_major_cancel_never_downgrades_critical_shutdown() {
        let cb = CircuitBreaker::new(BreakerThresholds::default());
        cb.evaluate(0.1);
        assert_eq!(cb.state(), BreakerState::CriticalShutdown);
        cb.force_major_cancel("should not downgrade");
        assert_eq!(cb.state(), BreakerState::CriticalShutdown);
    }

    #[test]
    fn quote_policy_matches_state() {
        let cb = CircuitBreaker::new(BreakerThresholds::default());
        assert!(cb.allows_new_quotes());
        cb.evaluate(0.5);
        assert!(!cb.allows_new_quotes());
        assert!(cb.allows_existing_orders());
        cb.evaluate(0.35);
        assert!(!cb.allows_existing_orders());
    }
}
