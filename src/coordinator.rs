// =============================================================================
// Coordinator — single struct-of-Arcs owning every subsystem (spec.md §9)
// =============================================================================
//
// No process-wide globals: every task is handed an `Arc<Coordinator>` and
// reaches subsystems through it. `Coordinator` exposes only a read-only
// `StateSnapshot` getter — there is no embedded dashboard server, by design.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use sysinfo::System;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::circuit_breaker::{BreakerThresholds, CircuitBreaker};
use crate::config::BotConfig;
use crate::exchange::auth::Credentials;
use crate::exchange::client::ExchangeClient;
use crate::exchange::events::WsEvent;
use crate::exchange::rate_limit::AdaptiveRateLimiter;
use crate::exchange::{PrivateStream, PublicStream};
use crate::health::{component, ComponentSnapshot, HealthScorer};
use crate::journal::{JournalEventType, JournalRecord, TradeJournal};
use crate::market_data::MarketDataIngestor;
use crate::notify::{fire_and_forget, Notifier, TracingNotifier};
use crate::orders::{OrderLifecycleManager, PositionManager};
use crate::strategy::engine::StrategyEngine;
use crate::symbol::SymbolInfo;
use crate::types::{BotState, ConnectionState, Severity};

/// Read-only view of the whole bot's state, for logging or an external
/// observer. There is no dashboard server inside this crate; anything that
/// wants this data polls `Coordinator::snapshot()` in-process.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StateSnapshot {
    pub symbol: String,
    pub bot_state: BotState,
    pub breaker_state: crate::types::BreakerState,
    pub health_aggregate: f64,
    pub health_components: Vec<ComponentSnapshot>,
    pub public_connection: ConnectionState,
    pub private_connection: ConnectionState,
    pub open_orders: usize,
    pub net_position: Decimal,
    pub wallet_balance: Decimal,
    pub mid: f64,
    pub rate_limiter_current_rate: f64,
}

/// Owns every long-lived subsystem for a single symbol. Constructed once at
/// startup via [`Coordinator::bootstrap`] and shared behind an `Arc` with
/// every spawned task.
pub struct Coordinator {
    pub config: Arc<RwLock<BotConfig>>,
    pub symbol_info: SymbolInfo,
    pub client: Arc<ExchangeClient>,
    pub limiter: Arc<AdaptiveRateLimiter>,
    pub market_data: Arc<MarketDataIngestor>,
    pub orders: Arc<OrderLifecycleManager>,
    pub positions: Arc<PositionManager>,
    pub health: Arc<HealthScorer>,
    pub breaker: Arc<CircuitBreaker>,
    pub journal: Arc<TradeJournal>,
    pub notifier: Arc<dyn Notifier>,
    pub strategy: Arc<StrategyEngine>,
    pub public_stream: Arc<PublicStream>,
    pub private_stream: Arc<PrivateStream>,
    pub bot_state: RwLock<BotState>,
    pub shutdown: Arc<AtomicBool>,
}

impl Coordinator {
    /// Full startup sequence: verify credentials, load symbol metadata, and
    /// wire every subsystem together. Returns `Err` if the exchange rejects
    /// the credentials or symbol lookup outright — there is nothing useful
    /// to run without either.
    pub async fn bootstrap(
        config: BotConfig,
        credentials: Credentials,
        base_url: String,
        ws_public_url: String,
        ws_private_url: String,
        journal_path: impl AsRef<std::path::Path>,
        position_mode: crate::types::PositionMode,
    ) -> anyhow::Result<Arc<Self>> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let health = Arc::new(HealthScorer::new());

        let limiter = Arc::new(AdaptiveRateLimiter::new(config.rate_limit_base, config.rate_limit_burst));
        let client = Arc::new(ExchangeClient::new(credentials.clone(), base_url, config.category.clone(), limiter.clone()));

        match client.test_credentials().await {
            Ok(()) => health.set_named(component::API_CREDENTIALS, 1.0, "credentials verified"),
            Err(e) => {
                health.set_named(component::API_CREDENTIALS, 0.0, format!("credential check failed: {e}"));
                anyhow::bail!("credential verification failed: {e}");
            }
        }

        let symbol_info = client.fetch_symbol_info(&config.symbol).await?;
        health.set_named(component::SYMBOL_INFO_LOADED, 1.0, "symbol metadata loaded");

        let market_data = Arc::new(MarketDataIngestor::new(
            config.symbol.clone(),
            config.orderbook_depth_levels as usize,
            config.abnormal_spread_threshold,
        ));
        let orders = Arc::new(OrderLifecycleManager::new(config.max_slippage_fraction));
        let positions = Arc::new(PositionManager::new());
        let breaker = Arc::new(CircuitBreaker::new(BreakerThresholds {
            minor: config.circuit_breaker.minor_threshold,
            major: config.circuit_breaker.major_threshold,
            critical: config.circuit_breaker.critical_threshold,
        }));
        let journal = Arc::new(TradeJournal::open(journal_path)?);
        let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);

        let public_stream = Arc::new(PublicStream::new(
            ws_public_url,
            config.symbol.clone(),
            config.orderbook_depth_levels,
            shutdown.clone(),
        ));
        let private_stream = Arc::new(PrivateStream::new(ws_private_url, credentials, shutdown.clone()));

        let config = Arc::new(RwLock::new(config));

        let strategy = Arc::new(StrategyEngine::new(
            config.clone(),
            symbol_info.clone(),
            client.clone(),
            limiter.clone(),
            market_data.clone(),
            orders.clone(),
            positions.clone(),
            health.clone(),
            breaker.clone(),
            journal.clone(),
            notifier.clone(),
            position_mode,
        ));

        info!(symbol = %symbol_info.symbol, "coordinator bootstrap complete");

        Ok(Arc::new(Self {
            config,
            symbol_info,
            client,
            limiter,
            market_data,
            orders,
            positions,
            health,
            breaker,
            journal,
            notifier,
            strategy,
            public_stream,
            private_stream,
            bot_state: RwLock::new(BotState::Starting),
            shutdown,
        }))
    }

    pub fn request_shutdown(&self) {
        *self.bot_state.write() = BotState::ShuttingDown;
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.breaker.shutdown_requested()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            symbol: self.symbol_info.symbol.clone(),
            bot_state: *self.bot_state.read(),
            breaker_state: self.breaker.state(),
            health_aggregate: self.health.aggregate(),
            health_components: self.health.snapshot(),
            public_connection: self.public_stream.connection_state(),
            private_connection: self.private_stream.connection_state(),
            open_orders: self.orders.open_count(),
            net_position: self.positions.net_size(),
            wallet_balance: self.positions.wallet().available_balance,
            mid: self.market_data.mid(),
            rate_limiter_current_rate: self.limiter.snapshot().current_rate,
        }
    }

    // -------------------------------------------------------------------------
    // Event dispatch
    // -------------------------------------------------------------------------

    /// Consumes parsed public-stream events and feeds the market-data
    /// ingestor. Runs for the lifetime of the channel.
    pub async fn dispatch_public_events(self: Arc<Self>, mut rx: mpsc::Receiver<WsEvent>) {
        while let Some(event) = rx.recv().await {
            if let WsEvent::OrderbookDepth(update) = event {
                self.market_data.handle_depth_update(&update);
            }
        }
    }

    /// Consumes parsed private-stream events, updating the order/position
    /// maps and appending fills to the trade journal.
    pub async fn dispatch_private_events(self: Arc<Self>, mut rx: mpsc::Receiver<WsEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                WsEvent::OrderUpdate(update) => {
                    if let Some(fill) = self.orders.apply_private_event(&update, &self.positions) {
                        self.record_fill(fill);
                    }
                }
                WsEvent::PositionUpdate(update) => {
                    self.positions.apply_position_update(&update);
                }
                WsEvent::WalletUpdate(update) => {
                    self.positions.update_wallet(update.available_balance, update.exchange_timestamp_ms);
                }
                WsEvent::OrderbookDepth(_) | WsEvent::Ping | WsEvent::Pong => {}
            }
        }
    }

    fn record_fill(&self, fill: crate::orders::FillEvent) {
        let (monotonic_ns, wall_clock_ms) = self.journal.stamp();
        let record = JournalRecord {
            monotonic_ns,
            wall_clock_ms,
            order_id: fill.order_id,
            client_order_id: fill.client_order_id,
            symbol: self.symbol_info.symbol.clone(),
            side: fill.side,
            fill_price: fill.fill_price,
            fill_quantity: fill.fill_quantity,
            realized_slippage_fraction: fill.realized_slippage_fraction,
            latency_ms: self.client.average_latency_ms().unwrap_or(0.0) as u64,
            event_type: JournalEventType::Filled,
        };
        if let Err(e) = self.journal.append(&record) {
            warn!(error = %e, "failed to append fill to trade journal");
        }
    }

    // -------------------------------------------------------------------------
    // Background loops
    // -------------------------------------------------------------------------

    /// Refreshes every named health component and re-evaluates the circuit
    /// breaker on `heartbeat_interval_seconds`. Specific predicates the
    /// breaker design calls out (abnormal spread, stale data, low order
    /// success, memory over budget, PnL over stop) are folded into the
    /// pre-weighted component they best match, and set to a neutral 1.0
    /// when their trigger is configured off rather than simply skipped —
    /// an untracked component would otherwise be silently excluded from the
    /// aggregate instead of neutralized.
    pub async fn run_health_and_breaker_loop(self: Arc<Self>) {
        let mut sys = System::new();
        loop {
            if self.shutdown_requested() {
                return;
            }
            let cfg = self.config.read().clone();

            self.update_connectivity_component(&cfg);
            self.update_market_data_component(&cfg);
            self.update_api_performance_component(&cfg);
            self.update_memory_component(&cfg, &mut sys);
            self.update_pnl_component(&cfg);

            let aggregate = self.health.aggregate();
            let transition = self.breaker.evaluate(aggregate);

            if transition.entered_major_cancel {
                warn!(aggregate, "breaker entered MajorCancel, cancelling all orders");
                if let Err(e) = self.client.cancel_all_orders(&cfg.symbol).await {
                    warn!(error = %e, "cancel-all during MajorCancel entry failed");
                }
                fire_and_forget(self.notifier.clone(), "circuit breaker: MajorCancel".into(), Severity::Warning);
            }
            if transition.entered_critical_shutdown {
                fire_and_forget(self.notifier.clone(), "circuit breaker: CriticalShutdown".into(), Severity::Critical);
            }

            tokio::time::sleep(Duration::from_secs(cfg.heartbeat_interval_seconds.max(1))).await;
        }
    }

    fn update_connectivity_component(&self, cfg: &BotConfig) {
        if !cfg.circuit_breaker.trigger_low_connection {
            self.health.set_named(component::WEBSOCKET_CONNECTIVITY, 1.0, "connectivity trigger disabled");
            return;
        }
        let score = |s: ConnectionState| match s {
            ConnectionState::Connected => 1.0,
            ConnectionState::Connecting => 0.5,
            ConnectionState::Disconnected => 0.0,
        };
        let avg = (score(self.public_stream.connection_state()) + score(self.private_stream.connection_state())) / 2.0;
        self.health.set_named(component::WEBSOCKET_CONNECTIVITY, avg, "public+private stream state");
    }

    fn update_market_data_component(&self, cfg: &BotConfig) {
        let stale_enabled = cfg.circuit_breaker.trigger_stale_timeout;
        let spread_enabled = cfg.circuit_breaker.trigger_abnormal_spread;
        if !stale_enabled && !spread_enabled {
            self.health.set_named(component::MARKET_DATA_FRESHNESS, 1.0, "freshness triggers disabled");
            return;
        }

        let fresh = self
            .market_data
            .is_fresh(Duration::from_secs(cfg.circuit_breaker.stale_data_timeout_secs));
        let mut score = if stale_enabled {
            self.market_data.data_quality()
        } else {
            1.0
        };
        if spread_enabled && self.market_data.spread_degraded() {
            score *= 0.5;
        }
        let message = if fresh { "fresh" } else { "stale" };
        self.health.set_named(component::MARKET_DATA_FRESHNESS, score, message);
    }

    fn update_api_performance_component(&self, cfg: &BotConfig) {
        let budget = cfg.circuit_breaker.api_latency_budget_ms;
        let mut score = match self.client.average_latency_ms() {
            Some(latency_ms) if latency_ms > budget && budget > 0.0 => (budget / latency_ms).clamp(0.0, 1.0),
            _ => 1.0,
        };
        if cfg.circuit_breaker.trigger_low_order_success {
            if let Some(success) = self.limiter.success_fraction() {
                score *= success;
            }
        }
        self.health.set_named(component::API_PERFORMANCE, score, "latency + order-success");
    }

    fn update_memory_component(&self, cfg: &BotConfig, sys: &mut System) {
        sys.refresh_memory();
        let used_mb = sys.used_memory() / (1024 * 1024);
        let limit = cfg.circuit_breaker.high_memory_mb.max(1);
        let score = if used_mb <= limit {
            1.0
        } else {
            (limit as f64 / used_mb as f64).clamp(0.0, 1.0)
        };
        self.health.set_named(component::SYSTEM_MEMORY, score, format!("{used_mb}MB / {limit}MB budget"));
    }

    fn update_pnl_component(&self, cfg: &BotConfig) {
        if !cfg.circuit_breaker.trigger_pnl_stop {
            self.health.set_named(component::STRATEGY_PNL, 1.0, "pnl-stop trigger disabled");
            return;
        }
        let mid = self.market_data.mid();
        let positions = self.positions.all();
        if mid <= 0.0 || positions.is_empty() {
            self.health.set_named(component::STRATEGY_PNL, 1.0, "no open position");
            return;
        }

        let worst = positions
            .iter()
            .filter_map(|p| {
                let entry = rust_decimal::prelude::ToPrimitive::to_f64(&p.entry_price).unwrap_or(0.0);
                if entry <= 0.0 {
                    return None;
                }
                Some(match p.side {
                    crate::types::Side::Buy => (mid - entry) / entry,
                    crate::types::Side::Sell => (entry - mid) / entry,
                })
            })
            .fold(f64::INFINITY, f64::min);

        if !worst.is_finite() {
            self.health.set_named(component::STRATEGY_PNL, 1.0, "no priced position");
            return;
        }

        let score = if worst >= 0.0 {
            1.0
        } else {
            (1.0 + worst / cfg.stop_loss_fraction.max(1e-9)).clamp(0.0, 1.0)
        };
        self.health.set_named(component::STRATEGY_PNL, score, format!("worst pnl fraction {worst:.4}"));
    }

    /// Declarative HTTP reconciliation: the open-orders/positions map
    /// replacement (spec.md §4.D) only runs as the fallback path, i.e.
    /// whenever the private stream is not `Connected` (including at
    /// startup, before the first subscribe ack lands). While the private
    /// stream is `Connected` it is the lower-latency, authoritative source
    /// and an HTTP snapshot can lag behind a just-placed order, so running
    /// the replacement then would race `register_new_order` and wipe an
    /// order the exchange has already accepted. The wallet balance is a
    /// plain snapshot rather than a replace-the-whole-map operation, so it
    /// is refreshed every pass regardless of connection state.
    pub async fn run_reconciliation_loop(self: Arc<Self>) {
        loop {
            if self.shutdown_requested() {
                return;
            }
            let cfg = self.config.read().clone();
            let private_connected = self.private_stream.connection_state() == ConnectionState::Connected;

            if !private_connected {
                if let Err(e) = self.reconcile_open_state(&cfg).await {
                    warn!(error = %e, "http reconciliation pass failed");
                }
            }
            if let Err(e) = self.refresh_wallet().await {
                warn!(error = %e, "wallet balance refresh failed");
            }

            let interval = if private_connected {
                cfg.reconcile_interval_seconds.max(1)
            } else {
                cfg.reconcile_interval_seconds.max(1).min(10)
            };
            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
    }

    /// Declarative replacement of the open-orders and positions maps from
    /// an authoritative HTTP poll. Only called while the private stream is
    /// not `Connected` — see [`run_reconciliation_loop`].
    async fn reconcile_open_state(&self, cfg: &BotConfig) -> anyhow::Result<()> {
        let orders = self.client.fetch_open_orders(&cfg.symbol).await?;
        self.orders.reconcile_from_http(&orders);

        let positions = self.client.fetch_positions(&cfg.symbol).await?;
        self.positions.reconcile_from_http(&positions);

        Ok(())
    }

    async fn refresh_wallet(&self) -> anyhow::Result<()> {
        let balance = self.client.fetch_wallet_balance("USDT").await?;
        self.positions.update_wallet(balance, Credentials::now_ms() as i64);
        Ok(())
    }

    /// Periodically re-reads the config file, applying a reload only when
    /// its content hash changes and the new document validates.
    pub async fn run_config_reload_loop(self: Arc<Self>, path: std::path::PathBuf) {
        let mut last_hash = self.config.read().content_hash();
        loop {
            if self.shutdown_requested() {
                return;
            }
            let interval = self.config.read().config_reload_interval_seconds.max(1);
            tokio::time::sleep(Duration::from_secs(interval)).await;

            match BotConfig::load(&path) {
                Ok(fresh) => {
                    let hash = fresh.content_hash();
                    if hash != last_hash {
                        info!("bot config changed, applying reload");
                        *self.config.write() = fresh;
                        last_hash = hash;
                    }
                }
                Err(e) => warn!(error = %e, "config reload failed, keeping previous config"),
            }
        }
    }
}
