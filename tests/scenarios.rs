//! End-to-end scenario tests for the trading core, driving the Event Bus,
//! Strategy Manager and Order Manager together the way a real indicator
//! producer and exchange fill stream would. Mirrors the S1-S6 scenarios
//! used to validate the state machine end to end.

use std::sync::Arc;

use pumpdump_engine::event_bus::{Event, EventBus};
use pumpdump_engine::order::{OrderManager, OrderSide};
use pumpdump_engine::risk::{DefaultRiskManager, RiskManager};
use pumpdump_engine::strategy::{
    Condition, ConditionGroup, ConditionValue, Direction, Strategy, StrategyManager, StrategyState,
};
use pumpdump_engine::EngineConfig;
use serde_json::json;

fn group(require_all: bool, conditions: Vec<Condition>) -> ConditionGroup {
    ConditionGroup::new("g", conditions, require_all)
}

fn empty() -> ConditionGroup {
    ConditionGroup::new("empty", vec![], true)
}

fn pump_trader() -> Strategy {
    let s1 = group(
        true,
        vec![
            Condition::new("pump", "pump_magnitude_pct", ">=", ConditionValue::Scalar(5.0)).unwrap(),
            Condition::new("vol", "volume_surge_ratio", ">=", ConditionValue::Scalar(2.0)).unwrap(),
        ],
    );
    let z1 = group(
        true,
        vec![Condition::new("pump", "pump_magnitude_pct", ">=", ConditionValue::Scalar(4.0)).unwrap()],
    );
    let ze1 = group(
        true,
        vec![Condition::new("profit", "profit_pct", ">=", ConditionValue::Scalar(10.0)).unwrap()],
    );
    let e1 = group(
        true,
        vec![Condition::new("velocity", "price_velocity", "<=", ConditionValue::Scalar(-15.0)).unwrap()],
    );
    Strategy::new("pump_trader", Direction::Long, s1, empty(), z1, ze1, e1)
}

async fn feed_indicator(bus: &EventBus, symbol: &str, key: &str, value: f64) {
    bus.publish(Event {
        topic: "indicator.updated".into(),
        source: "test".into(),
        payload: json!({"symbol": symbol, "indicator_type": key, "value": value}),
    })
    .await;
}

async fn feed_price(bus: &EventBus, symbol: &str, price: f64) {
    bus.publish(Event {
        topic: "market.price_update".into(),
        source: "test".into(),
        payload: json!({"symbol": symbol, "price": price}),
    })
    .await;
}

fn harness() -> (Arc<StrategyManager>, Arc<OrderManager>, EventBus) {
    harness_with_config(EngineConfig::default())
}

fn harness_with_config(config: EngineConfig) -> (Arc<StrategyManager>, Arc<OrderManager>, EventBus) {
    let event_bus = EventBus::new();
    let order_manager = Arc::new(OrderManager::with_seed(event_bus.clone(), 10_000, 42));
    let risk_manager: Arc<dyn RiskManager> = Arc::new(DefaultRiskManager::new(10_000.0, 0.25));
    let strategy_manager = Arc::new(StrategyManager::new(
        config,
        event_bus.clone(),
        order_manager.clone(),
        Some(risk_manager),
        None,
    ));
    (strategy_manager, order_manager, event_bus)
}

// S1: full profitable cycle from MONITORING to EXITED.
#[tokio::test]
async fn s1_full_profitable_cycle() {
    let (mgr, order_manager, bus) = harness();
    mgr.clone().start(false).await.unwrap();
    mgr.register_strategy(pump_trader(), "BTCUSDT");

    feed_indicator(&bus, "BTCUSDT", "pump_magnitude_pct", 7.5).await;
    feed_indicator(&bus, "BTCUSDT", "volume_surge_ratio", 3.0).await;
    assert_eq!(mgr.get_strategy_state("pump_trader").await, Some(StrategyState::SignalDetected));
    assert_eq!(mgr.get_slot_status().0, 1);

    feed_indicator(&bus, "BTCUSDT", "pump_magnitude_pct", 6.0).await;
    assert_eq!(mgr.get_strategy_state("pump_trader").await, Some(StrategyState::EntryEvaluation));

    feed_price(&bus, "BTCUSDT", 51_000.0).await;
    assert_eq!(mgr.get_strategy_state("pump_trader").await, Some(StrategyState::PositionActive));
    assert!(order_manager.get_position("BTCUSDT").unwrap().quantity > 0.0);

    feed_indicator(&bus, "BTCUSDT", "profit_pct", 12.0).await;
    assert_eq!(mgr.get_strategy_state("pump_trader").await, Some(StrategyState::CloseOrderEvaluation));

    // The close order itself is placed on the next evaluation cycle.
    feed_indicator(&bus, "BTCUSDT", "profit_pct", 12.0).await;
    assert_eq!(mgr.get_strategy_state("pump_trader").await, Some(StrategyState::Exited));
    assert_eq!(mgr.get_slot_status().0, 0);
    assert!(order_manager.get_position("BTCUSDT").is_none());
}

// S2: emergency exit overrides a simultaneously-true close condition.
#[tokio::test]
async fn s2_emergency_overrides_profit() {
    let (mgr, order_manager, bus) = harness();
    mgr.clone().start(false).await.unwrap();
    mgr.register_strategy(pump_trader(), "BTCUSDT");

    feed_indicator(&bus, "BTCUSDT", "pump_magnitude_pct", 7.5).await;
    feed_indicator(&bus, "BTCUSDT", "volume_surge_ratio", 3.0).await;
    feed_indicator(&bus, "BTCUSDT", "pump_magnitude_pct", 6.0).await;
    feed_price(&bus, "BTCUSDT", 51_000.0).await;
    assert_eq!(mgr.get_strategy_state("pump_trader").await, Some(StrategyState::PositionActive));
    assert!(order_manager.get_position("BTCUSDT").is_some());

    feed_indicator(&bus, "BTCUSDT", "profit_pct", 10.0).await;
    feed_indicator(&bus, "BTCUSDT", "price_velocity", -20.0).await;
    assert_eq!(mgr.get_strategy_state("pump_trader").await, Some(StrategyState::EmergencyExit));

    // The emergency exit order is placed on the next evaluation cycle, and
    // ZE1 (profit_pct already satisfied) must not have been taken instead.
    feed_indicator(&bus, "BTCUSDT", "price_velocity", -20.0).await;
    assert_eq!(mgr.get_strategy_state("pump_trader").await, Some(StrategyState::Exited));
    assert!(order_manager.get_position("BTCUSDT").is_none());

    let cooldown = mgr.get_cooldown_status("pump_trader").await.unwrap();
    assert_eq!(cooldown.1.as_deref(), Some("emergency_exit"));
}

// S3: O1 cancels a detected signal, releasing slot and lock.
#[tokio::test]
async fn s3_o1_cancels_signal() {
    let (mgr, _order_manager, bus) = harness();
    let mut strategy = pump_trader();
    strategy.o1_cancel = group(
        true,
        vec![Condition::new("cancel", "pump_magnitude_pct", "<", ConditionValue::Scalar(3.0)).unwrap()],
    );
    mgr.clone().start(false).await.unwrap();
    mgr.register_strategy(strategy, "BTCUSDT");

    feed_indicator(&bus, "BTCUSDT", "pump_magnitude_pct", 7.5).await;
    feed_indicator(&bus, "BTCUSDT", "volume_surge_ratio", 3.0).await;
    assert_eq!(mgr.get_strategy_state("pump_trader").await, Some(StrategyState::SignalDetected));

    feed_indicator(&bus, "BTCUSDT", "pump_magnitude_pct", 2.0).await;
    assert_eq!(mgr.get_strategy_state("pump_trader").await, Some(StrategyState::SignalCancelled));
    assert_eq!(mgr.get_slot_status().0, 0);

    let cooldown = mgr.get_cooldown_status("pump_trader").await.unwrap();
    assert_eq!(cooldown.1.as_deref(), Some("o1_cancelled"));
}

// S4: slot contention — exactly max_concurrent_signals strategies win.
#[tokio::test]
async fn s4_slot_contention_yields_exact_max() {
    let (mgr, _order_manager, bus) = harness();
    mgr.clone().start(false).await.unwrap();
    for i in 0..10 {
        mgr.register_strategy(
            {
                let mut s = pump_trader();
                s.strategy_name = format!("s{i}");
                s
            },
            &format!("SYM{i}"),
        );
    }

    for i in 0..10 {
        feed_indicator(&bus, &format!("SYM{i}"), "pump_magnitude_pct", 7.5).await;
        feed_indicator(&bus, &format!("SYM{i}"), "volume_surge_ratio", 3.0).await;
    }

    let mut detected = 0;
    for i in 0..10 {
        if mgr.get_strategy_state(&format!("s{i}")).await == Some(StrategyState::SignalDetected) {
            detected += 1;
        }
    }
    assert_eq!(detected, 3);
    assert_eq!(mgr.get_slot_status().0, 3);
}

// S5: a SHORT exceeding an existing LONG flips the position in one fill,
// closing the LONG leg with realized P&L and opening the SHORT leg.
#[tokio::test]
async fn s5_position_flip_closes_and_reopens() {
    let (_mgr, order_manager, _bus) = harness();
    order_manager
        .submit_order("BTCUSDT", OrderSide::Buy, 10.0, 50_000.0, "manual", 1, pumpdump_engine::order::OrderKind::Limit, 0.0)
        .await
        .unwrap();

    order_manager
        .submit_order("BTCUSDT", OrderSide::Short, 20.0, 51_000.0, "manual", 1, pumpdump_engine::order::OrderKind::Limit, 0.0)
        .await
        .unwrap();

    let pos = order_manager.get_position("BTCUSDT").unwrap();
    assert_eq!(pos.quantity, -10.0);
    assert_eq!(pos.average_price, 51_000.0);
    assert_eq!(order_manager.trade_history_len(), 1);
}

// S6: cooldown expiry resumes MONITORING and clears the cycle's timestamps.
#[tokio::test]
async fn s6_cooldown_resume_clears_cycle_state() {
    // A zero-second cancellation cooldown means the very next evaluation
    // sees `now >= cooldown_until` and resumes MONITORING.
    let mut config = EngineConfig::default();
    config.cooldowns.signal_cancel_secs = 0;
    let (mgr, _order_manager, bus) = harness_with_config(config);
    let mut strategy = pump_trader();
    strategy.o1_cancel = group(
        true,
        vec![Condition::new("cancel", "pump_magnitude_pct", "<", ConditionValue::Scalar(3.0)).unwrap()],
    );
    mgr.clone().start(false).await.unwrap();
    mgr.register_strategy(strategy, "BTCUSDT");

    feed_indicator(&bus, "BTCUSDT", "pump_magnitude_pct", 7.5).await;
    feed_indicator(&bus, "BTCUSDT", "volume_surge_ratio", 3.0).await;
    feed_indicator(&bus, "BTCUSDT", "pump_magnitude_pct", 2.0).await;
    assert_eq!(mgr.get_strategy_state("pump_trader").await, Some(StrategyState::SignalCancelled));

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    feed_indicator(&bus, "BTCUSDT", "pump_magnitude_pct", 1.0).await;
    assert_eq!(mgr.get_strategy_state("pump_trader").await, Some(StrategyState::Monitoring));
    let cooldown = mgr.get_cooldown_status("pump_trader").await.unwrap();
    assert!(cooldown.0.is_none());
}
