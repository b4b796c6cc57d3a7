//! Session Manager: admission control for multi-tenant trading sessions.
//! Grounded on `SessionManager` in
//! `original_source/src/trading/session_manager.py` (`start_session`,
//! `can_subscribe_symbol`, `record_operation`, `_monitor_sessions`,
//! `_cleanup_expired_sessions`).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::event_bus::{Event, EventBus};
use crate::market_adapter::MarketAdapter;

use super::circuit_breaker::SymbolCircuitBreaker;
use super::rate_limiter::{RateLimitDecision, RateLimiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Paper,
    Live,
    Backtest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Failed,
    CircuitOpen,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub client_id: String,
    pub symbols: Vec<String>,
    pub mode: SessionMode,
    pub state: SessionState,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub operations: u64,
    pub failures: u64,
    pub throttled: u64,
    pub active_subscriptions: Vec<String>,
}

struct Inner {
    sessions: HashMap<String, Session>,
    symbol_breakers: HashMap<String, SymbolCircuitBreaker>,
}

pub struct SessionManager {
    inner: Mutex<Inner>,
    rate_limiter: RateLimiter,
    cfg: EngineConfig,
    event_bus: EventBus,
    market_adapter: Arc<dyn MarketAdapter>,
}

impl SessionManager {
    pub fn new(cfg: EngineConfig, event_bus: EventBus, market_adapter: Arc<dyn MarketAdapter>) -> Self {
        let rate_limiter = RateLimiter::new(cfg.rate_limiter.clone());
        Self {
            inner: Mutex::new(Inner { sessions: HashMap::new(), symbol_breakers: HashMap::new() }),
            rate_limiter,
            cfg,
            event_bus,
            market_adapter,
        }
    }

    fn check_resource_limits(&self, inner: &Inner, client_id: &str, symbol_count: usize) -> EngineResult<()> {
        let limits = &self.cfg.resource_limits;
        if inner.sessions.len() >= limits.max_total_sessions as usize {
            return Err(EngineError::resource_unavailable("max_total_sessions reached"));
        }
        let per_client = inner.sessions.values().filter(|s| s.client_id == client_id).count();
        if per_client >= limits.max_sessions_per_client as usize {
            return Err(EngineError::resource_unavailable("max_sessions_per_client reached"));
        }
        if symbol_count > limits.max_symbols_per_session as usize {
            return Err(EngineError::resource_unavailable("max_symbols_per_session exceeded"));
        }
        Ok(())
    }

    pub async fn start_session(
        &self,
        session_id: &str,
        client_id: &str,
        symbols: Vec<String>,
        mode: SessionMode,
    ) -> EngineResult<()> {
        {
            let inner = self.inner.lock();
            self.check_resource_limits(&inner, client_id, symbols.len())?;
        }

        let now = Utc::now();
        let mut active_subscriptions = Vec::new();
        for symbol in &symbols {
            if self.market_adapter.subscribe_symbol(symbol).await.is_ok() {
                active_subscriptions.push(symbol.clone());
            } else {
                warn!(symbol, "subscription failed during start_session");
            }
        }

        let state = if active_subscriptions.is_empty() && !symbols.is_empty() {
            SessionState::Failed
        } else {
            SessionState::Running
        };

        {
            let mut inner = self.inner.lock();
            for symbol in &symbols {
                inner
                    .symbol_breakers
                    .entry(symbol.clone())
                    .or_insert_with(|| SymbolCircuitBreaker::new(&self.cfg.circuit_breaker));
            }
            inner.sessions.insert(
                session_id.to_string(),
                Session {
                    session_id: session_id.to_string(),
                    client_id: client_id.to_string(),
                    symbols: symbols.clone(),
                    mode,
                    state,
                    start_time: now,
                    last_activity: now,
                    operations: 0,
                    failures: 0,
                    throttled: 0,
                    active_subscriptions,
                },
            );
        }

        if state == SessionState::Failed {
            self.cleanup_session(session_id).await;
            return Err(EngineError::external("no symbol subscriptions succeeded"));
        }

        self.event_bus
            .publish(Event {
                topic: "session.started".into(),
                source: "session_manager".into(),
                payload: json!({"session_id": session_id, "client_id": client_id}),
            })
            .await;
        Ok(())
    }

    pub async fn stop_session(&self, session_id: &str) {
        self.cleanup_session(session_id).await;
        self.event_bus
            .publish(Event {
                topic: "session.stopped".into(),
                source: "session_manager".into(),
                payload: json!({"session_id": session_id}),
            })
            .await;
    }

    async fn cleanup_session(&self, session_id: &str) {
        let symbols = {
            let mut inner = self.inner.lock();
            inner.sessions.remove(session_id).map(|s| s.symbols).unwrap_or_default()
        };
        for symbol in symbols {
            let _ = self.market_adapter.unsubscribe_symbol(&symbol).await;
        }
    }

    /// (a) sliding-window rate limit, (b) records the check as an operation,
    /// (c) queries the symbol's circuit breaker. Atomic: any failure rejects
    /// without acquiring the others.
    pub fn can_subscribe_symbol(&self, symbol: &str) -> bool {
        let now = Utc::now();
        if self.rate_limiter.check_and_record(now) != RateLimitDecision::Allowed {
            return false;
        }
        let mut inner = self.inner.lock();
        let breaker = inner
            .symbol_breakers
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolCircuitBreaker::new(&self.cfg.circuit_breaker));
        breaker.can_attempt(now)
    }

    pub async fn record_operation(&self, session_id: &str, symbol: &str, success: bool) {
        let now = Utc::now();
        let opened = {
            let mut inner = self.inner.lock();
            let breaker = inner
                .symbol_breakers
                .entry(symbol.to_string())
                .or_insert_with(|| SymbolCircuitBreaker::new(&self.cfg.circuit_breaker));
            if success {
                breaker.record_success(now);
            } else {
                breaker.record_failure(now);
            }
            let opened = matches!(breaker.state, super::circuit_breaker::CircuitBreakerState::Open);

            if let Some(session) = inner.sessions.get_mut(session_id) {
                session.last_activity = now;
                session.operations += 1;
                if !success {
                    session.failures += 1;
                }
                if opened {
                    session.state = SessionState::CircuitOpen;
                }
            }
            opened
        };

        if opened {
            self.event_bus
                .publish(Event {
                    topic: "session.circuit_opened".into(),
                    source: "session_manager".into(),
                    payload: json!({"symbol": symbol}),
                })
                .await;
        }
    }

    /// Session health heartbeat: publishes `session.health`, stops sessions
    /// idle past `inactivity_timeout_secs`.
    pub async fn heartbeat_once(&self) {
        let now = Utc::now();
        let inactive_secs = self.cfg.session_lifecycle.inactivity_timeout_secs as i64;
        let stale: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .sessions
                .values()
                .filter(|s| (now - s.last_activity).num_seconds() > inactive_secs)
                .map(|s| s.session_id.clone())
                .collect()
        };
        for session_id in &stale {
            debug!(session_id, "stopping inactive session");
            self.stop_session(session_id).await;
        }
        self.event_bus
            .publish(Event {
                topic: "session.health".into(),
                source: "session_manager".into(),
                payload: json!({"active_sessions": self.inner.lock().sessions.len()}),
            })
            .await;
    }

    /// Expiry sweeper: stops sessions older than `session_expiry_secs`.
    pub async fn sweep_expired_once(&self) {
        let now = Utc::now();
        let expiry_secs = self.cfg.session_lifecycle.session_expiry_secs as i64;
        let expired: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .sessions
                .values()
                .filter(|s| (now - s.start_time).num_seconds() > expiry_secs)
                .map(|s| s.session_id.clone())
                .collect()
        };
        for session_id in &expired {
            info!(session_id, "expiring session past 24h lifetime");
            self.stop_session(session_id).await;
        }
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_adapter::PaperMarketAdapter;

    fn manager() -> SessionManager {
        SessionManager::new(EngineConfig::default(), EventBus::new(), Arc::new(PaperMarketAdapter))
    }

    #[tokio::test]
    async fn start_session_succeeds_with_paper_adapter() {
        let mgr = manager();
        mgr.start_session("s1", "client1", vec!["BTCUSDT".into()], SessionMode::Paper)
            .await
            .unwrap();
        assert_eq!(mgr.session_count(), 1);
    }

    #[tokio::test]
    async fn per_client_session_limit_enforced() {
        let mut cfg = EngineConfig::default();
        cfg.resource_limits.max_sessions_per_client = 1;
        let mgr = SessionManager::new(cfg, EventBus::new(), Arc::new(PaperMarketAdapter));
        mgr.start_session("s1", "client1", vec!["BTCUSDT".into()], SessionMode::Paper)
            .await
            .unwrap();
        let err = mgr.start_session("s2", "client1", vec!["ETHUSDT".into()], SessionMode::Paper).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn record_operation_opens_circuit_after_threshold_failures() {
        let mgr = manager();
        mgr.start_session("s1", "client1", vec!["BTCUSDT".into()], SessionMode::Paper)
            .await
            .unwrap();
        for _ in 0..5 {
            mgr.record_operation("s1", "BTCUSDT", false).await;
        }
        let session = mgr.get_session("s1").unwrap();
        assert_eq!(session.state, SessionState::CircuitOpen);
    }

    #[tokio::test]
    async fn stop_session_removes_it() {
        let mgr = manager();
        mgr.start_session("s1", "client1", vec!["BTCUSDT".into()], SessionMode::Paper)
            .await
            .unwrap();
        mgr.stop_session("s1").await;
        assert_eq!(mgr.session_count(), 0);
    }
}
