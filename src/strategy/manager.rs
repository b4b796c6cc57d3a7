//! Strategy Manager: the event-driven state machine from
//! `original_source/src/domain/services/strategy_manager.py`. Owns the
//! atomic slot/symbol-lock arbitration, the indicator cache, and the full
//! MONITORING → ... → EXITED dispatch for every registered (strategy,
//! symbol) pair.
//!
//! Lock ordering (never taken out of this order, matching the original's
//! documented discipline): evaluation-mutex(strategy) → slots-mutex →
//! symbol-locks-mutex → indicator-values-mutex.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::event_bus::{Event, EventBus, EventHandler, SubscriptionId};
use crate::order::{OrderKind, OrderManager, OrderSide};
use crate::risk::RiskManager;

use super::condition::ConditionResult;
use super::persistence::StrategyStore;
use super::strategy::{interpolate, Direction, Strategy, StrategyState};

/// Orders placed by the manager itself carry no configured slippage budget
/// of their own; this is the flat default applied to every entry/close/
/// emergency order, distinct from any per-order override a caller might add.
const DEFAULT_MAX_SLIPPAGE_PCT: f64 = 0.1;

struct SlotState {
    holders: HashSet<String>,
    max: u32,
}

struct Inner {
    strategies: HashMap<String, Arc<AsyncMutex<Strategy>>>,
    active_by_symbol: HashMap<String, Vec<String>>,
}

fn get_price(indicators: &HashMap<String, f64>) -> Option<f64> {
    indicators.get("price").or_else(|| indicators.get("last_price")).copied()
}

/// Strategy Manager. `Inner`'s map mutex is intentionally separate from the
/// per-strategy `tokio::sync::Mutex<Strategy>` held during evaluation: the
/// former is only ever held long enough to clone an `Arc`, never across an
/// `.await`.
pub struct StrategyManager {
    inner: SyncMutex<Inner>,
    slots: SyncMutex<SlotState>,
    symbol_locks: SyncMutex<HashMap<String, String>>,
    indicator_values: SyncMutex<HashMap<String, HashMap<String, f64>>>,
    evaluation_in_progress: SyncMutex<HashSet<String>>,
    eval_rate_ring: SyncMutex<VecDeque<DateTime<Utc>>>,
    background_tasks: SyncMutex<JoinSet<()>>,
    subscriptions: SyncMutex<Vec<(String, SubscriptionId)>>,
    config: EngineConfig,
    event_bus: EventBus,
    order_manager: Arc<OrderManager>,
    risk_manager: Option<Arc<dyn RiskManager>>,
    store: Option<Arc<dyn StrategyStore>>,
}

impl StrategyManager {
    pub fn new(
        config: EngineConfig,
        event_bus: EventBus,
        order_manager: Arc<OrderManager>,
        risk_manager: Option<Arc<dyn RiskManager>>,
        store: Option<Arc<dyn StrategyStore>>,
    ) -> Self {
        let max = config.max_concurrent_signals;
        Self {
            inner: SyncMutex::new(Inner { strategies: HashMap::new(), active_by_symbol: HashMap::new() }),
            slots: SyncMutex::new(SlotState { holders: HashSet::new(), max }),
            symbol_locks: SyncMutex::new(HashMap::new()),
            indicator_values: SyncMutex::new(HashMap::new()),
            evaluation_in_progress: SyncMutex::new(HashSet::new()),
            eval_rate_ring: SyncMutex::new(VecDeque::new()),
            background_tasks: SyncMutex::new(JoinSet::new()),
            subscriptions: SyncMutex::new(Vec::new()),
            config,
            event_bus,
            order_manager,
            risk_manager,
            store,
        }
    }

    /// Checked at `start()`: the Order Manager is wired by construction, but
    /// a missing Risk Manager is only a startup error when the caller asked
    /// the engine to require one (paper/backtest runs may opt out).
    pub fn validate_dependencies(&self, require_risk_manager: bool) -> EngineResult<()> {
        if require_risk_manager && self.risk_manager.is_none() {
            return Err(crate::error::EngineError::internal(
                "risk manager required but not wired",
            ));
        }
        Ok(())
    }

    /// Binds `strategy` to `symbol` and makes it eligible for evaluation.
    /// Persistence doesn't carry a symbol (it's transient runtime state), so
    /// callers supply it at registration time.
    pub fn register_strategy(&self, mut strategy: Strategy, symbol: &str) {
        strategy.runtime.0.symbol = symbol.to_string();
        let name = strategy.strategy_name.clone();
        let enabled = strategy.enabled;
        let mut inner = self.inner.lock();
        inner.strategies.insert(name.clone(), Arc::new(AsyncMutex::new(strategy)));
        if enabled {
            let list = inner.active_by_symbol.entry(symbol.to_string()).or_default();
            if !list.contains(&name) {
                list.push(name);
            }
        }
    }

    /// Loads every enabled strategy from the store and registers it bound to
    /// `symbol`. Each strategy monitors exactly one symbol; a multi-symbol
    /// engine calls this once per symbol with disjoint stores or filters the
    /// loaded set before registering.
    pub async fn load_enabled_strategies(&self, symbol: &str) -> EngineResult<usize> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };
        let strategies = store.load_enabled().await?;
        let count = strategies.len();
        for strategy in strategies {
            self.register_strategy(strategy, symbol);
        }
        Ok(count)
    }

    fn acquire_signal_slot(&self, name: &str) -> bool {
        let mut slots = self.slots.lock();
        if slots.holders.contains(name) {
            return true;
        }
        if slots.holders.len() as u32 >= slots.max {
            return false;
        }
        slots.holders.insert(name.to_string());
        true
    }

    fn release_signal_slot(&self, name: &str) {
        self.slots.lock().holders.remove(name);
    }

    fn lock_symbol(&self, symbol: &str, name: &str) -> bool {
        let mut locks = self.symbol_locks.lock();
        match locks.get(symbol) {
            Some(holder) if holder == name => true,
            Some(_) => false,
            None => {
                locks.insert(symbol.to_string(), name.to_string());
                true
            }
        }
    }

    fn unlock_symbol(&self, symbol: &str, name: &str) {
        let mut locks = self.symbol_locks.lock();
        if locks.get(symbol).map(String::as_str) == Some(name) {
            locks.remove(symbol);
        }
    }

    pub fn get_slot_status(&self) -> (usize, u32) {
        let slots = self.slots.lock();
        (slots.holders.len(), slots.max)
    }

    pub async fn get_cooldown_status(&self, name: &str) -> Option<(Option<DateTime<Utc>>, Option<String>)> {
        let arc = self.inner.lock().strategies.get(name).cloned()?;
        let strategy = arc.lock().await;
        Some((strategy.runtime.0.cooldown_until, strategy.runtime.0.cooldown_reason.clone()))
    }

    pub async fn get_strategy_state(&self, name: &str) -> Option<StrategyState> {
        let arc = self.inner.lock().strategies.get(name).cloned()?;
        let strategy = arc.lock().await;
        Some(strategy.runtime.0.current_state)
    }

    fn check_eval_rate(&self, now: DateTime<Utc>) -> bool {
        let mut ring = self.eval_rate_ring.lock();
        while ring.len() >= 1000 {
            ring.pop_front();
        }
        let one_sec_ago = now - Duration::seconds(1);
        let count = ring.iter().filter(|&&t| t > one_sec_ago).count() as u32;
        if count >= self.config.max_evals_per_sec {
            return false;
        }
        ring.push_back(now);
        true
    }

    fn spawn_diagnostic(&self, topic: impl Into<String>, payload: Value) {
        let bus = self.event_bus.clone();
        let topic = topic.into();
        self.background_tasks.lock().spawn(async move {
            bus.publish(Event { topic, source: "strategy_manager".into(), payload }).await;
        });
    }

    /// Estimates the quantity an actionable signal carries so `signal_generated`
    /// can drive an order-creating consumer per spec §6. S1 (entry) has no
    /// position yet, so quantity is the same independent position-size
    /// estimate `eval_entry_evaluation` computes off current indicators; E1
    /// and ZE1 (exit) report the quantity of the position they'd close.
    async fn estimate_signal_quantity(&self, strategy: &Strategy, symbol: &str, signal_type: &str, price: f64) -> f64 {
        if signal_type == "S1" {
            if !(price > 0.0) {
                return 0.0;
            }
            let indicators = self.indicator_values.lock().get(symbol).cloned().unwrap_or_default();
            let risk_indicator = indicators.get("risk_indicator").copied().unwrap_or(0.0);
            let risk_multiplier = interpolate(&strategy.global_limits.risk_adjustment_points, risk_indicator);
            let position_size_pct = (strategy.global_limits.base_position_pct * risk_multiplier)
                .clamp(strategy.global_limits.min_position_pct, strategy.global_limits.max_position_pct);
            let available_capital = self.available_capital().await;
            (available_capital * position_size_pct) / price
        } else {
            self.order_manager.get_position(symbol).map(|p| p.quantity.abs()).unwrap_or(0.0)
        }
    }

    async fn publish_signal_generated(&self, strategy: &Strategy, symbol: &str, signal_type: &str, action: &str) {
        let indicators = self.indicator_values.lock().get(symbol).cloned().unwrap_or_default();
        let price = get_price(&indicators).unwrap_or(0.0);
        let quantity = self.estimate_signal_quantity(strategy, symbol, signal_type, price).await;
        self.event_bus
            .publish(Event {
                topic: "signal_generated".into(),
                source: "strategy_manager".into(),
                payload: json!({
                    "signal_id": Uuid::new_v4().to_string(),
                    "signal_type": signal_type,
                    "symbol": symbol,
                    "side": action.to_ascii_lowercase(),
                    "action": action,
                    "quantity": quantity,
                    "price": price,
                    "strategy_name": strategy.strategy_name,
                    "strategy_id": strategy.strategy_name,
                    "triggered": true,
                    "conditions_met": indicators,
                    "indicator_values": indicators,
                    "metadata": {
                        "state": format!("{:?}", strategy.runtime.0.current_state),
                        "direction": format!("{:?}", strategy.direction),
                    },
                    "timestamp": Utc::now().timestamp(),
                }),
            })
            .await;
    }

    /// Subscribes this manager to `indicator.updated` and
    /// `market.price_update`. Requires an `Arc<Self>` since the subscriber
    /// handles outlive this call.
    pub async fn start(self: &Arc<Self>, require_risk_manager: bool) -> EngineResult<()> {
        self.validate_dependencies(require_risk_manager)?;

        let indicator_handler: Arc<dyn EventHandler> = Arc::new(IndicatorUpdateHandler(self.clone()));
        let price_handler: Arc<dyn EventHandler> = Arc::new(PriceUpdateHandler(self.clone()));

        let id1 = self.event_bus.subscribe("indicator.updated", indicator_handler);
        let id2 = self.event_bus.subscribe("market.price_update", price_handler);

        let mut subs = self.subscriptions.lock();
        subs.push(("indicator.updated".into(), id1));
        subs.push(("market.price_update".into(), id2));
        Ok(())
    }

    pub fn shutdown(&self) {
        let subs: Vec<(String, SubscriptionId)> = self.subscriptions.lock().drain(..).collect();
        for (topic, id) in subs {
            self.event_bus.unsubscribe(&topic, id);
        }
        self.background_tasks.lock().abort_all();
        info!("strategy manager shut down");
    }

    /// Clears every slot/lock/indicator/in-progress entry and resets every
    /// registered strategy to MONITORING. Used between paper sessions and in
    /// tests that need a clean slate without re-registering strategies.
    pub async fn reset_session_state(&self) {
        self.slots.lock().holders.clear();
        self.symbol_locks.lock().clear();
        self.indicator_values.lock().clear();
        self.evaluation_in_progress.lock().clear();

        let strategies: Vec<Arc<AsyncMutex<Strategy>>> = self.inner.lock().strategies.values().cloned().collect();
        for arc in strategies {
            arc.lock().await.reset_to_monitoring();
        }
    }

    async fn on_indicator_event(&self, event: &Event) {
        if event.source == "strategy_manager" {
            return;
        }
        let Some(symbol) = event.payload.get("symbol").and_then(Value::as_str) else { return };
        let Some(key) = event
            .payload
            .get("indicator_type")
            .or_else(|| event.payload.get("indicator"))
            .and_then(Value::as_str)
        else {
            return;
        };
        let Some(value) = event.payload.get("value").and_then(Value::as_f64) else { return };

        {
            let mut map = self.indicator_values.lock();
            map.entry(symbol.to_string()).or_default().insert(key.to_ascii_lowercase(), value);
        }

        self.trigger_evaluations_for_symbol(symbol).await;
    }

    async fn on_price_event(&self, event: &Event) {
        if event.source == "strategy_manager" {
            return;
        }
        let Some(symbol) = event.payload.get("symbol").and_then(Value::as_str) else { return };
        let Some(price) = event.payload.get("price").and_then(Value::as_f64) else { return };

        {
            let mut map = self.indicator_values.lock();
            let entry = map.entry(symbol.to_string()).or_default();
            entry.insert("price".into(), price);
            entry.insert("last_price".into(), price);
        }

        self.trigger_evaluations_for_symbol(symbol).await;
    }

    async fn trigger_evaluations_for_symbol(&self, symbol: &str) {
        {
            let mut in_progress = self.evaluation_in_progress.lock();
            if in_progress.contains(symbol) {
                return;
            }
            in_progress.insert(symbol.to_string());
        }

        let now = Utc::now();
        if !self.check_eval_rate(now) {
            self.spawn_diagnostic("rate_limit_exceeded", json!({"symbol": symbol}));
            self.evaluation_in_progress.lock().remove(symbol);
            return;
        }

        let names: Vec<String> =
            self.inner.lock().active_by_symbol.get(symbol).cloned().unwrap_or_default();
        for name in names {
            self.evaluate_strategy(&name, symbol, now).await;
        }

        self.evaluation_in_progress.lock().remove(symbol);
    }

    async fn evaluate_strategy(&self, name: &str, symbol: &str, now: DateTime<Utc>) {
        let arc = { self.inner.lock().strategies.get(name).cloned() };
        let Some(arc) = arc else { return };
        let mut strategy = arc.lock().await;
        if !strategy.enabled {
            return;
        }

        if matches!(strategy.runtime.0.current_state, StrategyState::SignalCancelled | StrategyState::Exited) {
            if let Some(until) = strategy.runtime.0.cooldown_until {
                if now >= until {
                    let previous = strategy.runtime.0.current_state;
                    let cooldown_reason = strategy.runtime.0.cooldown_reason.clone();
                    strategy.reset_to_monitoring();
                    drop(strategy);
                    self.spawn_diagnostic(
                        "monitoring_resumed",
                        json!({
                            "strategy_name": name,
                            "symbol": symbol,
                            "previous_state": format!("{previous:?}"),
                            "reason": "cooldown_expired",
                            "cooldown_reason": cooldown_reason,
                        }),
                    );
                } else {
                    // Cooldown only gates re-entry to MONITORING; it never
                    // applies inside a state, so this is a pure diagnostic.
                    drop(strategy);
                    self.spawn_diagnostic(
                        "cooldown_active",
                        json!({"strategy_name": name, "symbol": symbol, "cooldown_until": until.timestamp()}),
                    );
                }
            }
            return;
        }

        let indicators = self.indicator_values.lock().get(symbol).cloned().unwrap_or_default();

        match strategy.runtime.0.current_state {
            StrategyState::Inactive | StrategyState::SignalCancelled | StrategyState::Exited => {}
            StrategyState::Monitoring => self.eval_monitoring(&mut strategy, symbol, now, &indicators).await,
            StrategyState::SignalDetected => self.eval_signal_detected(&mut strategy, symbol, now, &indicators).await,
            StrategyState::EntryEvaluation => self.eval_entry_evaluation(&mut strategy, symbol, &indicators).await,
            StrategyState::PositionActive => self.eval_position_active(&mut strategy, symbol, now, &indicators).await,
            StrategyState::CloseOrderEvaluation => self.eval_close_order(&mut strategy, symbol, &indicators).await,
            StrategyState::EmergencyExit => self.eval_emergency_exit(&mut strategy, symbol, &indicators).await,
        }
    }

    async fn eval_monitoring(&self, strategy: &mut Strategy, symbol: &str, now: DateTime<Utc>, indicators: &HashMap<String, f64>) {
        if strategy.s1_signal.evaluate(indicators) != ConditionResult::True {
            return;
        }

        if !self.acquire_signal_slot(&strategy.strategy_name) {
            self.spawn_diagnostic(
                "signal_slot_unavailable",
                json!({"strategy_name": strategy.strategy_name, "symbol": symbol, "reason": "max_concurrent_signals"}),
            );
            return;
        }
        if !self.lock_symbol(symbol, &strategy.strategy_name) {
            self.release_signal_slot(&strategy.strategy_name);
            self.spawn_diagnostic(
                "signal_slot_unavailable",
                json!({"strategy_name": strategy.strategy_name, "symbol": symbol, "reason": "symbol_locked"}),
            );
            return;
        }

        strategy.runtime.0.signal_detection_time = Some(now);
        strategy.runtime.0.current_state = StrategyState::SignalDetected;
        let action = strategy.entry_action();
        self.publish_signal_generated(strategy, symbol, "S1", action).await;
        self.spawn_diagnostic("signal.slot_acquired", json!({"strategy_name": strategy.strategy_name, "symbol": symbol}));
    }

    async fn eval_signal_detected(&self, strategy: &mut Strategy, symbol: &str, now: DateTime<Utc>, indicators: &HashMap<String, f64>) {
        let mut ind = indicators.clone();
        if let Some(detected_at) = strategy.runtime.0.signal_detection_time {
            ind.insert("signal_age_seconds".into(), (now - detected_at).num_seconds() as f64);
        }

        if strategy.o1_cancel.evaluate(&ind) == ConditionResult::True {
            self.release_signal_slot(&strategy.strategy_name);
            self.unlock_symbol(symbol, &strategy.strategy_name);
            strategy.runtime.0.current_state = StrategyState::SignalCancelled;
            strategy.runtime.0.cooldown_until = Some(now + Duration::seconds(self.config.cooldowns.signal_cancel_secs as i64));
            strategy.runtime.0.cooldown_reason = Some("o1_cancelled".into());
            self.spawn_diagnostic(
                "strategy.signal_cancelled",
                json!({"strategy_name": strategy.strategy_name, "symbol": symbol}),
            );
            return;
        }

        if strategy.z1_entry.evaluate(&ind) == ConditionResult::True {
            strategy.runtime.0.current_state = StrategyState::EntryEvaluation;
        }
    }

    async fn available_capital(&self) -> f64 {
        match &self.risk_manager {
            Some(rm) => rm.get_available_capital().await,
            None => 10_000.0,
        }
    }

    async fn eval_entry_evaluation(&self, strategy: &mut Strategy, symbol: &str, indicators: &HashMap<String, f64>) {
        let Some(price) = get_price(indicators) else { return };
        if !(price > 0.0) {
            return;
        }

        let risk_indicator = indicators.get("risk_indicator").copied().unwrap_or(0.0);
        let risk_multiplier = interpolate(&strategy.global_limits.risk_adjustment_points, risk_indicator);
        let position_size_pct = (strategy.global_limits.base_position_pct * risk_multiplier)
            .clamp(strategy.global_limits.min_position_pct, strategy.global_limits.max_position_pct);

        let available_capital = self.available_capital().await;
        let notional = available_capital * position_size_pct;
        let quantity = notional / price;
        if !(quantity > 0.0) {
            return;
        }

        let mut approved = true;
        if let Some(rm) = &self.risk_manager {
            match rm.assess_position_risk(&strategy.strategy_name, 0.5, notional).await {
                Ok(assessment) => approved = assessment.approved && rm.can_open_position_sync(notional),
                Err(err) => {
                    warn!(error = %err, "risk assessment failed, rejecting entry");
                    approved = false;
                }
            }
        }

        if !approved {
            self.release_signal_slot(&strategy.strategy_name);
            self.unlock_symbol(symbol, &strategy.strategy_name);
            strategy.reset_to_monitoring();
            self.spawn_diagnostic(
                "strategy.entry_rejected",
                json!({"strategy_name": strategy.strategy_name, "symbol": symbol, "notional": notional}),
            );
            return;
        }

        if let Some(rm) = &self.risk_manager {
            if let Err(err) = rm.use_budget(notional).await {
                warn!(error = %err, "budget reservation failed, rejecting entry");
                self.release_signal_slot(&strategy.strategy_name);
                self.unlock_symbol(symbol, &strategy.strategy_name);
                strategy.reset_to_monitoring();
                return;
            }
        }

        let side = match strategy.direction {
            Direction::Long | Direction::Both => OrderSide::Buy,
            Direction::Short => OrderSide::Short,
        };

        match self
            .order_manager
            .submit_order(symbol, side, quantity, price, &strategy.strategy_name, 1, OrderKind::Market, DEFAULT_MAX_SLIPPAGE_PCT)
            .await
        {
            Ok(_order) => {
                strategy.runtime.0.entry_time = Some(Utc::now());
                strategy.runtime.0.position_active = true;
                strategy.runtime.0.reserved_notional = notional;
                strategy.runtime.0.current_state = StrategyState::PositionActive;
            }
            Err(err) => {
                warn!(error = %err, "entry order failed, reverting to monitoring");
                if let Some(rm) = &self.risk_manager {
                    rm.release_budget(notional).await;
                }
                self.release_signal_slot(&strategy.strategy_name);
                self.unlock_symbol(symbol, &strategy.strategy_name);
                strategy.reset_to_monitoring();
            }
        }
    }

    async fn eval_position_active(&self, strategy: &mut Strategy, symbol: &str, now: DateTime<Utc>, indicators: &HashMap<String, f64>) {
        // Hard priority: E1 is evaluated before ZE1 and, if triggered, ZE1
        // is skipped this cycle entirely.
        if strategy.e1_emergency.evaluate(indicators) == ConditionResult::True {
            strategy.runtime.0.current_state = StrategyState::EmergencyExit;
            strategy.runtime.0.cooldown_until = Some(now + Duration::seconds(self.config.cooldowns.emergency_exit_secs as i64));
            strategy.runtime.0.cooldown_reason = Some("emergency_exit".into());
            let action = strategy.exit_action();
            self.publish_signal_generated(strategy, symbol, "E1", action).await;
            return;
        }

        if strategy.ze1_close.evaluate(indicators) == ConditionResult::True {
            strategy.runtime.0.current_state = StrategyState::CloseOrderEvaluation;
            let action = strategy.exit_action();
            self.publish_signal_generated(strategy, symbol, "ZE1", action).await;
        }
    }

    async fn settle_exit(&self, strategy: &mut Strategy, symbol: &str, entry_price: f64, qty: f64, fill_price: f64, cooldown_secs: i64, reason: &str) {
        let realized_pnl = match strategy.direction {
            Direction::Long | Direction::Both => (fill_price - entry_price) * qty,
            Direction::Short => (entry_price - fill_price) * qty,
        };
        let won = realized_pnl > 0.0;

        if let Some(rm) = &self.risk_manager {
            rm.release_budget(strategy.runtime.0.reserved_notional).await;
            rm.update_trade_outcome(realized_pnl, won, &strategy.strategy_name, 0.5).await;
        }

        strategy.runtime.0.current_state = StrategyState::Exited;
        strategy.runtime.0.exit_time = Some(Utc::now());
        strategy.runtime.0.position_active = false;
        strategy.runtime.0.reserved_notional = 0.0;
        strategy.runtime.0.cooldown_until = Some(Utc::now() + Duration::seconds(cooldown_secs));
        strategy.runtime.0.cooldown_reason = Some(reason.to_string());

        self.release_signal_slot(&strategy.strategy_name);
        self.unlock_symbol(symbol, &strategy.strategy_name);

        self.spawn_diagnostic(
            "strategy.position_closed",
            json!({"strategy_name": strategy.strategy_name, "symbol": symbol, "realized_pnl": realized_pnl, "reason": reason}),
        );
    }

    async fn eval_close_order(&self, strategy: &mut Strategy, symbol: &str, indicators: &HashMap<String, f64>) {
        let Some(price) = get_price(indicators) else { return };
        let Some(pre_position) = self.order_manager.get_position(symbol) else {
            // Already flat: nothing to close through the order manager, but
            // the state machine still needs to settle.
            strategy.runtime.0.current_state = StrategyState::Exited;
            return;
        };

        let risk_indicator = indicators.get("risk_indicator").copied().unwrap_or(0.0);
        let adjustment_pct = interpolate(&strategy.global_limits.close_price_adjustment_points, risk_indicator);
        let adjusted_price = price * (1.0 + adjustment_pct / 100.0);

        match self
            .order_manager
            .close_position(symbol, adjusted_price, &strategy.strategy_name, DEFAULT_MAX_SLIPPAGE_PCT)
            .await
        {
            Ok(Some(order)) => {
                self.settle_exit(
                    strategy,
                    symbol,
                    pre_position.average_price,
                    pre_position.quantity.abs(),
                    order.actual_price,
                    self.config.cooldowns.normal_exit_secs as i64,
                    "normal_exit",
                )
                .await;
            }
            Ok(None) => {
                strategy.runtime.0.current_state = StrategyState::Exited;
            }
            Err(err) => {
                warn!(error = %err, symbol, "close order failed, retrying next cycle");
            }
        }
    }

    async fn eval_emergency_exit(&self, strategy: &mut Strategy, symbol: &str, indicators: &HashMap<String, f64>) {
        let Some(pre_position) = self.order_manager.get_position(symbol) else {
            strategy.runtime.0.current_state = StrategyState::Exited;
            return;
        };
        let price = get_price(indicators).unwrap_or(pre_position.average_price);
        if !(price > 0.0) {
            return;
        }

        match self.order_manager.emergency_exit(symbol, price, &strategy.strategy_name).await {
            Ok(Some(order)) => {
                self.settle_exit(
                    strategy,
                    symbol,
                    pre_position.average_price,
                    pre_position.quantity.abs(),
                    order.actual_price,
                    self.config.cooldowns.emergency_exit_secs as i64,
                    "emergency_exit",
                )
                .await;
            }
            Ok(None) => {
                strategy.runtime.0.current_state = StrategyState::Exited;
            }
            Err(err) => {
                warn!(error = %err, symbol, "emergency exit failed, retrying next cycle");
            }
        }
    }
}

struct IndicatorUpdateHandler(Arc<StrategyManager>);

#[async_trait]
impl EventHandler for IndicatorUpdateHandler {
    async fn handle(&self, event: &Event) {
        self.0.on_indicator_event(event).await;
    }
}

struct PriceUpdateHandler(Arc<StrategyManager>);

#[async_trait]
impl EventHandler for PriceUpdateHandler {
    async fn handle(&self, event: &Event) {
        self.0.on_price_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::condition::{Condition, ConditionGroup, ConditionValue};

    fn always_true_group(indicator: &str) -> ConditionGroup {
        ConditionGroup::new(
            "g",
            vec![Condition::new("c", indicator, ">=", ConditionValue::Scalar(0.0)).unwrap()],
            true,
        )
    }

    fn empty_group() -> ConditionGroup {
        ConditionGroup::new("empty", vec![], true)
    }

    fn sample_strategy(name: &str) -> Strategy {
        Strategy::new(
            name,
            Direction::Long,
            always_true_group("pump_magnitude_pct"),
            empty_group(),
            always_true_group("pump_magnitude_pct"),
            always_true_group("pump_magnitude_pct"),
            empty_group(),
        )
    }

    fn manager() -> Arc<StrategyManager> {
        let event_bus = EventBus::new();
        let order_manager = Arc::new(OrderManager::with_seed(event_bus.clone(), 1000, 7));
        Arc::new(StrategyManager::new(EngineConfig::default(), event_bus, order_manager, None, None))
    }

    async fn feed_price(mgr: &Arc<StrategyManager>, symbol: &str, price: f64) {
        mgr.event_bus
            .publish(Event {
                topic: "market.price_update".into(),
                source: "test".into(),
                payload: json!({"symbol": symbol, "price": price}),
            })
            .await;
    }

    async fn feed_indicator(mgr: &Arc<StrategyManager>, symbol: &str, key: &str, value: f64) {
        mgr.event_bus
            .publish(Event {
                topic: "indicator.updated".into(),
                source: "test".into(),
                payload: json!({"symbol": symbol, "indicator_type": key, "value": value}),
            })
            .await;
    }

    #[tokio::test]
    async fn s1_detection_acquires_slot_and_lock() {
        let mgr = manager();
        mgr.clone().start(false).await.unwrap();
        mgr.register_strategy(sample_strategy("s1"), "BTCUSDT");

        feed_indicator(&mgr, "BTCUSDT", "pump_magnitude_pct", 9.0).await;

        assert_eq!(mgr.get_strategy_state("s1").await, Some(StrategyState::SignalDetected));
        assert_eq!(mgr.get_slot_status().0, 1);
    }

    #[tokio::test]
    async fn full_cycle_reaches_position_active_then_exits() {
        let mgr = manager();
        mgr.clone().start(false).await.unwrap();
        mgr.register_strategy(sample_strategy("cycle"), "BTCUSDT");

        feed_indicator(&mgr, "BTCUSDT", "pump_magnitude_pct", 9.0).await;
        assert_eq!(mgr.get_strategy_state("cycle").await, Some(StrategyState::SignalDetected));

        feed_indicator(&mgr, "BTCUSDT", "pump_magnitude_pct", 9.0).await;
        assert_eq!(mgr.get_strategy_state("cycle").await, Some(StrategyState::EntryEvaluation));

        feed_price(&mgr, "BTCUSDT", 100.0).await;
        assert_eq!(mgr.get_strategy_state("cycle").await, Some(StrategyState::PositionActive));

        feed_indicator(&mgr, "BTCUSDT", "pump_magnitude_pct", 9.0).await;
        assert_eq!(mgr.get_strategy_state("cycle").await, Some(StrategyState::CloseOrderEvaluation));

        feed_price(&mgr, "BTCUSDT", 110.0).await;
        assert_eq!(mgr.get_strategy_state("cycle").await, Some(StrategyState::Exited));
        assert_eq!(mgr.get_slot_status().0, 0);
    }

    #[tokio::test]
    async fn fourth_concurrent_signal_is_refused_a_slot() {
        let mgr = manager();
        mgr.clone().start(false).await.unwrap();
        for i in 0..4 {
            mgr.register_strategy(sample_strategy(&format!("s{i}")), &format!("SYM{i}"));
        }

        for i in 0..4 {
            feed_indicator(&mgr, &format!("SYM{i}"), "pump_magnitude_pct", 9.0).await;
        }

        let mut detected = 0;
        for i in 0..4 {
            if mgr.get_strategy_state(&format!("s{i}")).await == Some(StrategyState::SignalDetected) {
                detected += 1;
            }
        }
        assert_eq!(detected, 3);
        assert_eq!(mgr.get_slot_status().0, 3);
    }
}
