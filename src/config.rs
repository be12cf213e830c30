// =============================================================================
// Bot Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable parameter the strategy needs lives here so the engine can be
// reconfigured without a restart. Persistence uses an atomic tmp + rename
// pattern; all fields carry `#[serde(default = "...")]` so that adding new
// fields never breaks loading an older config file. A sha2 hash of the whole
// document determines change detection on reload (spec.md §6).
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::types::OrderType;

fn default_true() -> bool {
    true
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_category() -> String {
    "linear".to_string()
}

fn default_base_quantity() -> Decimal {
    dec!(0.01)
}

fn default_base_spread_fraction() -> f64 {
    0.001
}

fn default_max_open_orders() -> u32 {
    2
}

fn default_order_lifespan_seconds() -> u64 {
    60
}

fn default_rebalance_threshold() -> Decimal {
    dec!(0.05)
}

fn default_profit_take_fraction() -> f64 {
    0.02
}

fn default_stop_loss_fraction() -> f64 {
    0.015
}

fn default_price_threshold_fraction() -> f64 {
    0.003
}

fn default_capital_allocation_fraction() -> Decimal {
    dec!(0.2)
}

fn default_max_position_fraction() -> Decimal {
    dec!(0.4)
}

fn default_abnormal_spread_threshold() -> f64 {
    0.01
}

fn default_max_slippage_fraction() -> f64 {
    0.002
}

fn default_orderbook_depth_levels() -> u32 {
    5
}

fn default_rebalance_offset() -> f64 {
    0.001
}

fn default_tick_seconds() -> f64 {
    0.7
}

fn default_rate_limit_base() -> f64 {
    10.0
}

fn default_rate_limit_burst() -> f64 {
    20.0
}

fn default_performance_factor() -> Decimal {
    dec!(1.0)
}

fn default_heartbeat_interval_seconds() -> u64 {
    15
}

fn default_memory_cleanup_interval_seconds() -> u64 {
    300
}

fn default_config_reload_interval_seconds() -> u64 {
    30
}

fn default_reconcile_interval_seconds() -> u64 {
    60
}

fn default_pnl_monitor_interval_seconds() -> u64 {
    5
}

fn default_minor_threshold() -> f64 {
    0.6
}

fn default_major_threshold() -> f64 {
    0.4
}

fn default_critical_threshold() -> f64 {
    0.2
}

fn default_high_memory_mb() -> u64 {
    1024
}

fn default_stale_data_timeout_secs() -> u64 {
    10
}

fn default_api_latency_budget_ms() -> f64 {
    3000.0
}

fn default_trading_hours_start() -> u8 {
    0
}

fn default_trading_hours_end() -> u8 {
    23
}

fn default_rebalance_order_type() -> OrderType {
    OrderType::Market
}

fn default_plugin_folder() -> String {
    "plugins".to_string()
}

fn default_strategy_name() -> String {
    "default".to_string()
}

/// Circuit-breaker thresholds and trigger settings (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_minor_threshold")]
    pub minor_threshold: f64,
    #[serde(default = "default_major_threshold")]
    pub major_threshold: f64,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    #[serde(default = "default_true")]
    pub trigger_pnl_stop: bool,
    #[serde(default = "default_true")]
    pub trigger_abnormal_spread: bool,
    #[serde(default = "default_true")]
    pub trigger_stale_timeout: bool,
    #[serde(default = "default_true")]
    pub trigger_low_connection: bool,
    #[serde(default = "default_true")]
    pub trigger_low_order_success: bool,
    #[serde(default = "default_high_memory_mb")]
    pub high_memory_mb: u64,
    #[serde(default = "default_stale_data_timeout_secs")]
    pub stale_data_timeout_secs: u64,
    #[serde(default = "default_api_latency_budget_ms")]
    pub api_latency_budget_ms: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            minor_threshold: default_minor_threshold(),
            major_threshold: default_major_threshold(),
            critical_threshold: default_critical_threshold(),
            trigger_pnl_stop: true,
            trigger_abnormal_spread: true,
            trigger_stale_timeout: true,
            trigger_low_connection: true,
            trigger_low_order_success: true,
            high_memory_mb: default_high_memory_mb(),
            stale_data_timeout_secs: default_stale_data_timeout_secs(),
            api_latency_budget_ms: default_api_latency_budget_ms(),
        }
    }
}

/// Trading-hours gate (UTC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingHoursConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_trading_hours_start")]
    pub start_hour_utc: u8,
    #[serde(default = "default_trading_hours_end")]
    pub end_hour_utc: u8,
}

impl Default for TradingHoursConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_hour_utc: default_trading_hours_start(),
            end_hour_utc: default_trading_hours_end(),
        }
    }
}

/// Top-level hot-reloadable bot configuration (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_category")]
    pub category: String,

    #[serde(default = "default_base_quantity")]
    pub base_quantity: Decimal,
    #[serde(default = "default_base_spread_fraction")]
    pub base_spread_fraction: f64,
    #[serde(default = "default_max_open_orders")]
    pub max_open_orders: u32,
    #[serde(default = "default_order_lifespan_seconds")]
    pub order_lifespan_seconds: u64,
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: Decimal,
    #[serde(default = "default_profit_take_fraction")]
    pub profit_take_fraction: f64,
    #[serde(default = "default_stop_loss_fraction")]
    pub stop_loss_fraction: f64,
    #[serde(default = "default_price_threshold_fraction")]
    pub price_threshold_fraction: f64,
    #[serde(default = "default_capital_allocation_fraction")]
    pub capital_allocation_fraction: Decimal,
    #[serde(default = "default_max_position_fraction")]
    pub max_position_fraction: Decimal,
    #[serde(default = "default_abnormal_spread_threshold")]
    pub abnormal_spread_threshold: f64,
    #[serde(default = "default_max_slippage_fraction")]
    pub max_slippage_fraction: f64,
    #[serde(default = "default_orderbook_depth_levels")]
    pub orderbook_depth_levels: u32,
    #[serde(default = "default_rebalance_order_type")]
    pub rebalance_order_type: OrderType,
    #[serde(default = "default_rebalance_offset")]
    pub rebalance_offset: f64,

    #[serde(default)]
    pub trading_hours: TradingHoursConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default = "default_rate_limit_base")]
    pub rate_limit_base: f64,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: f64,
    #[serde(default = "default_true")]
    pub rate_limit_adaptive: bool,

    #[serde(default = "default_true")]
    pub volatility_adjustment_enabled: bool,
    #[serde(default = "default_true")]
    pub adaptive_quantity_enabled: bool,
    #[serde(default = "default_performance_factor")]
    pub performance_factor: Decimal,

    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: f64,
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_memory_cleanup_interval_seconds")]
    pub memory_cleanup_interval_seconds: u64,
    #[serde(default = "default_config_reload_interval_seconds")]
    pub config_reload_interval_seconds: u64,
    #[serde(default = "default_reconcile_interval_seconds")]
    pub reconcile_interval_seconds: u64,
    #[serde(default = "default_pnl_monitor_interval_seconds")]
    pub pnl_monitor_interval_seconds: u64,

    #[serde(default = "default_plugin_folder")]
    pub plugin_folder: String,
    #[serde(default = "default_strategy_name")]
    pub strategy_name: String,

    #[serde(default)]
    pub dashboard_refresh_rate_ms: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            category: default_category(),
            base_quantity: default_base_quantity(),
            base_spread_fraction: default_base_spread_fraction(),
            max_open_orders: default_max_open_orders(),
            order_lifespan_seconds: default_order_lifespan_seconds(),
            rebalance_threshold: default_rebalance_threshold(),
            profit_take_fraction: default_profit_take_fraction(),
            stop_loss_fraction: default_stop_loss_fraction(),
            price_threshold_fraction: default_price_threshold_fraction(),
            capital_allocation_fraction: default_capital_allocation_fraction(),
            max_position_fraction: default_max_position_fraction(),
            abnormal_spread_threshold: default_abnormal_spread_threshold(),
            max_slippage_fraction: default_max_slippage_fraction(),
            orderbook_depth_levels: default_orderbook_depth_levels(),
            rebalance_order_type: default_rebalance_order_type(),
            rebalance_offset: default_rebalance_offset(),
            trading_hours: TradingHoursConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit_base: default_rate_limit_base(),
            rate_limit_burst: default_rate_limit_burst(),
            rate_limit_adaptive: true,
            volatility_adjustment_enabled: true,
            adaptive_quantity_enabled: true,
            performance_factor: default_performance_factor(),
            tick_seconds: default_tick_seconds(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            memory_cleanup_interval_seconds: default_memory_cleanup_interval_seconds(),
            config_reload_interval_seconds: default_config_reload_interval_seconds(),
            reconcile_interval_seconds: default_reconcile_interval_seconds(),
            pnl_monitor_interval_seconds: default_pnl_monitor_interval_seconds(),
            plugin_folder: default_plugin_folder(),
            strategy_name: default_strategy_name(),
            dashboard_refresh_rate_ms: 500,
        }
    }
}

impl BotConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read bot config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse bot config from {}", path.display()))?;
        config.validate().context("loaded config failed validation")?;
        info!(path = %path.display(), symbol = %config.symbol, "bot config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialize bot config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "bot config saved (atomic)");
        Ok(())
    }

    /// Validation gate applied before accepting a reloaded config: fractions
    /// in (0,1]; breaker thresholds monotone (critical <= major <= minor);
    /// all positive quantities strictly positive; hours in [0,23].
    pub fn validate(&self) -> Result<()> {
        let fractions = [
            ("base_spread_fraction", self.base_spread_fraction),
            ("profit_take_fraction", self.profit_take_fraction),
            ("stop_loss_fraction", self.stop_loss_fraction),
            ("price_threshold_fraction", self.price_threshold_fraction),
            ("abnormal_spread_threshold", self.abnormal_spread_threshold),
            ("max_slippage_fraction", self.max_slippage_fraction),
            ("rebalance_offset", self.rebalance_offset),
        ];
        for (name, value) in fractions {
            if !(value > 0.0 && value <= 1.0) {
                anyhow::bail!("{name} must be in (0,1], got {value}");
            }
        }

        if !(self.circuit_breaker.critical_threshold <= self.circuit_breaker.major_threshold
            && self.circuit_breaker.major_threshold <= self.circuit_breaker.minor_threshold)
        {
            anyhow::bail!("circuit breaker thresholds must be monotone: critical <= major <= minor");
        }

        let positive_quantities = [
            ("base_quantity", self.base_quantity),
            ("rebalance_threshold", self.rebalance_threshold),
        ];
        for (name, value) in positive_quantities {
            if value <= Decimal::ZERO {
                anyhow::bail!("{name} must be strictly positive, got {value}");
            }
        }

        let decimal_fractions = [
            ("capital_allocation_fraction", self.capital_allocation_fraction),
            ("max_position_fraction", self.max_position_fraction),
        ];
        for (name, value) in decimal_fractions {
            if !(value > Decimal::ZERO && value <= Decimal::ONE) {
                anyhow::bail!("{name} must be in (0,1], got {value}");
            }
        }

        if self.max_open_orders == 0 {
            anyhow::bail!("max_open_orders must be strictly positive");
        }
        if self.orderbook_depth_levels == 0 {
            anyhow::bail!("orderbook_depth_levels must be strictly positive");
        }

        if self.trading_hours.start_hour_utc > 23 || self.trading_hours.end_hour_utc > 23 {
            anyhow::bail!("trading hours must be in [0,23]");
        }

        Ok(())
    }

    /// sha2-256 hex digest of the serialized document, used for reload
    /// change detection.
    pub fn content_hash(&self) -> String {
        let content = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        let cfg = BotConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: BotConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.max_open_orders, 2);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "symbol": "ETHUSDT" }"#;
        let cfg: BotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.category, "linear");
    }

    #[test]
    fn non_monotone_breaker_thresholds_fail_validation() {
        let mut cfg = BotConfig::default();
        cfg.circuit_breaker.major_threshold = 0.9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_range_fraction_fails_validation() {
        let mut cfg = BotConfig::default();
        cfg.base_spread_fraction = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_position_fraction_above_one_fails_validation() {
        let mut cfg = BotConfig::default();
        cfg.max_position_fraction = dec!(2.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn capital_allocation_fraction_above_one_fails_validation() {
        let mut cfg = BotConfig::default();
        cfg.capital_allocation_fraction = dec!(1.5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn content_hash_changes_with_content() {
        let a = BotConfig::default();
        let mut b = BotConfig::default();
        b.symbol = "ETHUSDT".to_string();
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = BotConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: BotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbol, cfg2.symbol);
        assert_eq!(cfg.base_quantity, cfg2.base_quantity);
    }
}
