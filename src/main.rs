// =============================================================================
// Aurora Perp Nexus — Main Entry Point
// =============================================================================
//
// Wires a single-symbol perpetual-futures market maker together: verifies
// exchange credentials, loads symbol metadata, spawns the public/private
// market-data streams, the health/breaker heartbeat, the HTTP reconciliation
// fallback, the config hot-reload watcher, and the strategy tick + PnL-stop
// loops. Everything is reached through one `Arc<Coordinator>` — there is no
// process-wide global state.
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

use aurora_perp_nexus::config::BotConfig;
use aurora_perp_nexus::coordinator::Coordinator;
use aurora_perp_nexus::exchange::auth::Credentials;
use aurora_perp_nexus::types::PositionMode;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("aurora-perp-nexus starting up");

    let config_path = std::env::var("BOT_CONFIG_PATH").unwrap_or_else(|_| "bot_config.json".into());
    let config = BotConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "failed to load bot config, using defaults");
        BotConfig::default()
    });

    let api_key = std::env::var("EXCHANGE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("EXCHANGE_API_SECRET").unwrap_or_default();
    let credentials = Credentials::new(api_key, api_secret);

    let base_url = std::env::var("EXCHANGE_REST_URL").unwrap_or_else(|_| "https://api.bybit.com".into());
    let ws_public_url =
        std::env::var("EXCHANGE_WS_PUBLIC_URL").unwrap_or_else(|_| "wss://stream.bybit.com/v5/public/linear".into());
    let ws_private_url =
        std::env::var("EXCHANGE_WS_PRIVATE_URL").unwrap_or_else(|_| "wss://stream.bybit.com/v5/private".into());
    let position_mode = match std::env::var("EXCHANGE_POSITION_MODE").as_deref() {
        Ok("hedge") | Ok("Hedge") => PositionMode::Hedge,
        _ => PositionMode::OneWay,
    };
    let journal_path = std::env::var("TRADE_JOURNAL_PATH").unwrap_or_else(|_| "trade_journal.jsonl".into());

    let coordinator = Coordinator::bootstrap(
        config,
        credentials,
        base_url,
        ws_public_url,
        ws_private_url,
        journal_path,
        position_mode,
    )
    .await?;

    info!(symbol = %coordinator.symbol_info.symbol, "coordinator ready, launching subsystems");

    let (public_tx, public_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (private_tx, private_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let public_stream = coordinator.public_stream.clone();
    tokio::spawn(async move {
        public_stream.run(public_tx).await;
    });

    let private_stream = coordinator.private_stream.clone();
    tokio::spawn(async move {
        private_stream.run(private_tx).await;
    });

    tokio::spawn(coordinator.clone().dispatch_public_events(public_rx));
    tokio::spawn(coordinator.clone().dispatch_private_events(private_rx));
    tokio::spawn(coordinator.clone().run_health_and_breaker_loop());
    tokio::spawn(coordinator.clone().run_reconciliation_loop());
    tokio::spawn(coordinator.clone().run_config_reload_loop(PathBuf::from(&config_path)));

    let pnl_strategy = coordinator.strategy.clone();
    let pnl_shutdown = coordinator.shutdown.clone();
    tokio::spawn(async move {
        pnl_strategy.run_pnl_monitor(pnl_shutdown).await;
    });

    let tick_coordinator = coordinator.clone();
    tokio::spawn(async move {
        loop {
            if tick_coordinator.shutdown_requested() {
                return;
            }
            let tick_seconds = tick_coordinator.config.read().tick_seconds.max(0.1);
            let outcome = tick_coordinator.strategy.tick().await;
            info!(?outcome, "strategy tick complete");
            tokio::time::sleep(Duration::from_secs_f64(tick_seconds)).await;
        }
    });

    info!("all subsystems running, waiting for shutdown signal");
    wait_for_shutdown_signal().await;
    warn!("shutdown signal received, stopping gracefully");

    coordinator.request_shutdown();
    if let Err(e) = coordinator.client.cancel_all_orders(&coordinator.symbol_info.symbol).await {
        error!(error = %e, "failed to cancel open orders during shutdown");
    }

    info!("aurora-perp-nexus shut down complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
