// =============================================================================
// Health Scorer — weighted aggregate of named components (spec.md §4.E)
// =============================================================================
//
// A component contributes to the aggregate only if it was updated within the
// last 120 s. If no component qualifies, aggregate defaults to 1.0. Readers
// never block writers for more than a point update.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Components only count toward the aggregate if updated within this window.
const FRESHNESS_WINDOW: Duration = Duration::from_secs(120);

/// Pre-weighted component names the core populates (spec.md §4.E table).
pub mod component {
    pub const API_CREDENTIALS: &str = "api_credentials";
    pub const WEBSOCKET_CONNECTIVITY: &str = "websocket_connectivity";
    pub const SYMBOL_INFO_LOADED: &str = "symbol_info_loaded";
    pub const MARKET_DATA_FRESHNESS: &str = "market_data_freshness";
    pub const STRATEGY_PNL: &str = "strategy_pnl";
    pub const SYSTEM_MEMORY: &str = "system_memory";
    pub const API_PERFORMANCE: &str = "api_performance";
    pub const BOT_STATE: &str = "bot_state";
}

/// Default weights for the named components the core populates.
pub fn default_weight(name: &str) -> f64 {
    match name {
        component::API_CREDENTIALS => 2.0,
        component::WEBSOCKET_CONNECTIVITY => 2.0,
        component::SYMBOL_INFO_LOADED => 1.8,
        component::MARKET_DATA_FRESHNESS => 1.3,
        component::STRATEGY_PNL => 1.5,
        component::SYSTEM_MEMORY => 1.5,
        component::API_PERFORMANCE => 1.2,
        component::BOT_STATE => 1.0,
        _ => 1.0,
    }
}

#[derive(Debug, Clone)]
struct ComponentState {
    score: f64,
    weight: f64,
    last_updated: Instant,
    message: String,
}

/// Serializable view of a single component, for dashboards/logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub name: String,
    pub score: f64,
    pub weight: f64,
    pub age_secs: f64,
    pub message: String,
    pub stale: bool,
}

/// Holds an arbitrary set of named health components and computes the
/// weighted aggregate consumed by the circuit breaker.
pub struct HealthScorer {
    components: RwLock<HashMap<String, ComponentState>>,
}

impl HealthScorer {
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
        }
    }

    /// Sets (or creates) a component's score, weight, and message, stamping
    /// it as just-updated. Score is clamped to [0,1].
    pub fn set(&self, name: &str, score: f64, weight: f64, message: impl Into<String>) {
        let clamped = score.clamp(0.0, 1.0);
        let mut components = self.components.write();
        components.insert(
            name.to_string(),
            ComponentState {
                score: clamped,
                weight,
                last_updated: Instant::now(),
                message: message.into(),
            },
        );
    }

    /// Convenience for the pre-weighted named components: uses the default
    /// weight table.
    pub fn set_named(&self, name: &str, score: f64, message: impl Into<String>) {
        self.set(name, score, default_weight(name), message);
    }

    /// `Σ(score × weight) / Σ(weight)` over components updated within the
    /// last 120s; 1.0 if no component qualifies.
    pub fn aggregate(&self) -> f64 {
        let components = self.components.read();
        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        for state in components.values() {
            if state.last_updated.elapsed() <= FRESHNESS_WINDOW {
                weighted_sum += state.score * state.weight;
                weight_sum += state.weight;
            }
        }
        if weight_sum <= 0.0 {
            1.0
        } else {
            weighted_sum / weight_sum
        }
    }

    pub fn snapshot(&self) -> Vec<ComponentSnapshot> {
        let components = self.components.read();
        components
            .iter()
            .map(|(name, state)| ComponentSnapshot {
                name: name.clone(),
                score: state.score,
                weight: state.weight,
                age_secs: state.last_updated.elapsed().as_secs_f64(),
                message: state.message.clone(),
                stale: state.last_updated.elapsed() > FRESHNESS_WINDOW,
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.components.read().get(name).map(|s| s.score)
    }
}

impl Default for HealthScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_defaults_to_one_with_no_components() {
        let scorer = HealthScorer::new();
        assert_eq!(scorer.aggregate(), 1.0);
    }

    #[test]
    fn aggregate_is_weighted_average_of_fresh_components() {
        let scorer = HealthScorer::new();
        scorer.set("a", 1.0, 1.0, "ok");
        scorer.set("b", 0.0, 3.0, "bad");
        // (1.0*1 + 0.0*3) / 4 = 0.25
        assert!((scorer.aggregate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn score_is_clamped_to_unit_interval() {
        let scorer = HealthScorer::new();
        scorer.set("x", 5.0, 1.0, "over");
        assert_eq!(scorer.get("x"), Some(1.0));
        scorer.set("y", -5.0, 1.0, "under");
        assert_eq!(scorer.get("y"), Some(0.0));
    }
}
