//! Pump-and-dump detection and execution engine.
//!
//! Wires the Event Bus, Order Manager, Session Manager, Risk Manager and
//! Strategy Manager together and drives the background housekeeping loops
//! (session heartbeat, expiry sweep). No REST/WS surface: the engine is a
//! headless trading core; operational visibility is tracing + the
//! in-process `Telemetry` counters, not an HTTP API.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pumpdump_engine::config::EngineConfig;
use pumpdump_engine::event_bus::EventBus;
use pumpdump_engine::market_adapter::PaperMarketAdapter;
use pumpdump_engine::order::OrderManager;
use pumpdump_engine::risk::{DefaultRiskManager, RiskManager};
use pumpdump_engine::session::{SessionManager, SessionMode};
use pumpdump_engine::strategy::{SqliteStrategyStore, StrategyManager, StrategyStore};
use pumpdump_engine::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("pump-and-dump engine starting");

    let config = EngineConfig::from_env();
    let event_bus = EventBus::new();
    let telemetry = Arc::new(Telemetry::new(config.telemetry.clone()));

    let order_manager = Arc::new(OrderManager::new(event_bus.clone(), config.trade_history_cap));
    order_manager.clone().start().await;

    let initial_capital = env::var("INITIAL_CAPITAL")
        .unwrap_or_else(|_| "10000".to_string())
        .parse::<f64>()
        .context("invalid INITIAL_CAPITAL")?;
    let kelly_fraction = env::var("KELLY_FRACTION")
        .unwrap_or_else(|_| "0.25".to_string())
        .parse::<f64>()
        .context("invalid KELLY_FRACTION")?;
    let risk_manager: Arc<dyn RiskManager> =
        Arc::new(DefaultRiskManager::new(initial_capital, kelly_fraction));

    let store: Option<Arc<dyn StrategyStore>> = match SqliteStrategyStore::open(&config.db_path) {
        Ok(store) => {
            info!(path = %config.db_path, "strategy store opened");
            Some(Arc::new(store))
        }
        Err(e) => {
            warn!(error = %e, "strategy store unavailable; running without persistence");
            None
        }
    };

    let strategy_manager = Arc::new(StrategyManager::new(
        config.clone(),
        event_bus.clone(),
        order_manager.clone(),
        Some(risk_manager.clone()),
        store,
    ));

    let symbols = env::var("TRADING_SYMBOLS")
        .unwrap_or_else(|_| "BTCUSDT".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    for symbol in &symbols {
        match strategy_manager.load_enabled_strategies(symbol).await {
            Ok(n) => info!(symbol, loaded = n, "enabled strategies registered"),
            Err(e) => warn!(symbol, error = %e, "failed to load strategies"),
        }
    }

    strategy_manager
        .start(true)
        .await
        .context("strategy manager failed to start")?;

    let session_manager = Arc::new(SessionManager::new(
        config.clone(),
        event_bus.clone(),
        Arc::new(PaperMarketAdapter),
    ));

    let session_mode = env::var("SESSION_MODE")
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "live" => Some(SessionMode::Live),
            "backtest" => Some(SessionMode::Backtest),
            "paper" => Some(SessionMode::Paper),
            _ => None,
        })
        .unwrap_or(SessionMode::Paper);

    session_manager
        .start_session("main", "engine", symbols.clone(), session_mode)
        .await
        .context("failed to start primary session")?;

    {
        let session_manager = session_manager.clone();
        let heartbeat_secs = config.session_lifecycle.heartbeat_interval_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(heartbeat_secs));
            loop {
                ticker.tick().await;
                session_manager.heartbeat_once().await;
            }
        });
    }

    {
        let session_manager = session_manager.clone();
        let cleanup_secs = config.session_lifecycle.cleanup_interval_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(cleanup_secs));
            loop {
                ticker.tick().await;
                session_manager.sweep_expired_once().await;
            }
        });
    }

    telemetry.incr_counter("engine.started", 1);
    info!(symbols = symbols.len(), "engine running; awaiting shutdown signal");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    strategy_manager.shutdown();
    session_manager.stop_session("main").await;
    order_manager.stop().await;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pumpdump_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv::dotenv();
}
