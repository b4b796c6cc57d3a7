//! Order Manager: order/position bookkeeping, slippage simulation, and the
//! sign-convention contract. Grounded on `_update_position`,
//! `_simulate_slippage`, `_validate_order_inputs`,
//! `_calculate_liquidation_price` in
//! `original_source/src/domain/services/order_manager.py`, and on a
//! VWAP/fee-deduction averaging style matching a paper trading ledger.
//!
//! Deliberate deviation from the original: SELL/COVER clamp to flat instead
//! of silently flipping sign (see `DESIGN.md`).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::event_bus::{Event, EventBus, EventHandler, SubscriptionId};

use super::types::{Order, OrderKind, OrderSide, OrderStatus, Position, PositionType};

const MAX_MAGNITUDE: f64 = 1e15;

#[derive(Debug, Clone)]
pub struct TradeHistoryEntry {
    pub symbol: String,
    pub realized_pnl: f64,
    pub closed_at: chrono::DateTime<Utc>,
}

struct Inner {
    positions: HashMap<String, Position>,
    orders: HashMap<String, Order>,
    trade_history: VecDeque<TradeHistoryEntry>,
    trade_history_cap: usize,
    rng: ChaCha8Rng,
}

pub struct OrderManager {
    inner: Mutex<Inner>,
    order_seq: AtomicU64,
    event_bus: EventBus,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl OrderManager {
    pub fn new(event_bus: EventBus, trade_history_cap: usize) -> Self {
        Self::with_rng(event_bus, trade_history_cap, ChaCha8Rng::from_entropy())
    }

    /// Seedable constructor so slippage simulation is reproducible in tests.
    pub fn with_seed(event_bus: EventBus, trade_history_cap: usize, seed: u64) -> Self {
        Self::with_rng(event_bus, trade_history_cap, ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(event_bus: EventBus, trade_history_cap: usize, rng: ChaCha8Rng) -> Self {
        Self {
            inner: Mutex::new(Inner {
                positions: HashMap::new(),
                orders: HashMap::new(),
                trade_history: VecDeque::new(),
                trade_history_cap,
                rng,
            }),
            order_seq: AtomicU64::new(1),
            event_bus,
            subscription: Mutex::new(None),
        }
    }

    /// Subscribes to `signal_generated` (spec §4.2 input contract). The
    /// handler observes and logs every actionable signal for audit; it does
    /// not itself call `submit_order`. Order creation stays on the
    /// synchronous call path driven by the Strategy Manager's own
    /// ENTRY_EVALUATION / CLOSE_ORDER_EVALUATION / EMERGENCY_EXIT steps,
    /// which need the `Result` back to decide the next state transition — an
    /// event-bus `publish` can't return that. The original also submits an
    /// order from its `_on_signal_generated` handler on top of the direct
    /// call made later in `ENTRY_EVALUATION`, which double-submits for every
    /// S1 signal; this implementation doesn't reproduce that (see
    /// `DESIGN.md`).
    pub async fn start(self: &Arc<Self>) {
        let handler: Arc<dyn EventHandler> = Arc::new(SignalGeneratedHandler(self.clone()));
        let id = self.event_bus.subscribe("signal_generated", handler);
        *self.subscription.lock() = Some(id);
    }

    async fn on_signal_generated(&self, event: &Event) {
        if event.source == "order_manager" {
            return;
        }
        let signal_type = event.payload.get("signal_type").and_then(Value::as_str).unwrap_or("");
        if !matches!(signal_type, "S1" | "ZE1" | "E1") {
            return;
        }
        let symbol = event.payload.get("symbol").and_then(Value::as_str).unwrap_or("");
        let side = event.payload.get("side").and_then(Value::as_str).unwrap_or("");
        let quantity = event.payload.get("quantity").and_then(Value::as_f64).unwrap_or(0.0);
        let price = event.payload.get("price").and_then(Value::as_f64).unwrap_or(0.0);
        if symbol.is_empty() || side.is_empty() || !(quantity > 0.0) || !(price > 0.0) {
            warn!(signal_type, symbol, side, quantity, price, "signal_generated observed with incomplete fields");
            return;
        }
        debug!(signal_type, symbol, side, quantity, price, "signal_generated observed");
    }

    fn next_order_id(&self) -> String {
        let seq = self.order_seq.fetch_add(1, AtomicOrdering::SeqCst);
        format!("paper_order_{seq:06}")
    }

    fn validate(
        symbol: &str,
        quantity: f64,
        price: f64,
        leverage: u32,
        max_slippage_pct: f64,
    ) -> EngineResult<()> {
        if symbol.trim().is_empty() {
            return Err(EngineError::validation("symbol must not be empty"));
        }
        if !quantity.is_finite() || quantity <= 0.0 || quantity > MAX_MAGNITUDE {
            return Err(EngineError::validation("quantity must be in (0, 1e15]"));
        }
        if !price.is_finite() || price <= 0.0 || price > MAX_MAGNITUDE {
            return Err(EngineError::validation("price must be in (0, 1e15]"));
        }
        if !(1..=10).contains(&leverage) {
            return Err(EngineError::validation("leverage must be in [1, 10]"));
        }
        if max_slippage_pct < 0.0 {
            return Err(EngineError::validation("max_slippage_pct must be >= 0"));
        }
        if leverage > 5 {
            warn!(leverage, "leverage above 5 narrows liquidation distance");
        }
        Ok(())
    }

    /// `Uniform(0, max_slippage_pct)`. BUY/SHORT raise price, SELL/COVER
    /// lower it. `price = 0` returns `(0, slippage)` without error, and
    /// `max_slippage_pct = 0` always returns `(price, 0)`.
    fn simulate_slippage(rng: &mut ChaCha8Rng, side: OrderSide, price: f64, max_slippage_pct: f64) -> (f64, f64) {
        if max_slippage_pct <= 0.0 {
            return (price, 0.0);
        }
        let slippage_pct = rng.gen_range(0.0..=max_slippage_pct);
        let actual = match side {
            OrderSide::Buy | OrderSide::Short => price * (1.0 + slippage_pct / 100.0),
            OrderSide::Sell | OrderSide::Cover => price * (1.0 - slippage_pct / 100.0),
        };
        (actual, slippage_pct)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        strategy_name: &str,
        leverage: u32,
        order_kind: OrderKind,
        max_slippage_pct: f64,
    ) -> EngineResult<Order> {
        Self::validate(symbol, quantity, price, leverage, max_slippage_pct)?;

        let order_id = self.next_order_id();
        let now = Utc::now();

        let (actual_price, actual_slippage_pct) = {
            let mut inner = self.inner.lock();
            match order_kind {
                OrderKind::Market => Self::simulate_slippage(&mut inner.rng, side, price, max_slippage_pct),
                OrderKind::Limit => (price, 0.0),
            }
        };

        let order = Order {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            side,
            quantity,
            requested_price: price,
            actual_price,
            status: OrderStatus::Filled,
            created_at: now,
            updated_at: now,
            strategy_name: strategy_name.to_string(),
            leverage,
            order_kind,
            max_slippage_pct,
            actual_slippage_pct,
        };

        {
            let mut inner = self.inner.lock();
            inner.orders.insert(order_id.clone(), order.clone());
        }

        self.event_bus
            .publish(Event {
                topic: "order_created".into(),
                source: "order_manager".into(),
                payload: json!({
                    "order_id": order.order_id,
                    "symbol": order.symbol,
                    "status": "PENDING",
                }),
            })
            .await;

        self.event_bus
            .publish(Event {
                topic: "order_filled".into(),
                source: "order_manager".into(),
                payload: json!({
                    "order_id": order.order_id,
                    "symbol": order.symbol,
                    "status": "FILLED",
                    "price": order.actual_price,
                    "quantity": order.quantity,
                    "timestamp": order.updated_at.timestamp(),
                }),
            })
            .await;

        self.apply_fill(&order).await?;

        Ok(order)
    }

    async fn apply_fill(&self, order: &Order) -> EngineResult<()> {
        let outcome = {
            let mut inner = self.inner.lock();
            Self::update_position_locked(&mut inner, order)?
        };

        match outcome {
            PositionOutcome::Opened => {
                self.event_bus
                    .publish(Event {
                        topic: "position_opened".into(),
                        source: "order_manager".into(),
                        payload: json!({"symbol": order.symbol, "price": order.actual_price, "quantity": order.quantity}),
                    })
                    .await;
            }
            PositionOutcome::Closed { realized_pnl } => {
                self.event_bus
                    .publish(Event {
                        topic: "position_closed".into(),
                        source: "order_manager".into(),
                        payload: json!({"symbol": order.symbol, "realized_pnl": realized_pnl}),
                    })
                    .await;
            }
            PositionOutcome::Updated => {
                self.event_bus
                    .publish(Event {
                        topic: "position_updated".into(),
                        source: "order_manager".into(),
                        payload: json!({"symbol": order.symbol, "quantity": self.position_quantity(&order.symbol)}),
                    })
                    .await;
            }
            PositionOutcome::Flipped { realized_pnl } => {
                // A BUY/SHORT that crosses through zero closes the old leg
                // and opens the new one in the same fill (spec §8 S5):
                // two events, not one `position_updated`.
                self.event_bus
                    .publish(Event {
                        topic: "position_closed".into(),
                        source: "order_manager".into(),
                        payload: json!({"symbol": order.symbol, "realized_pnl": realized_pnl}),
                    })
                    .await;
                self.event_bus
                    .publish(Event {
                        topic: "position_opened".into(),
                        source: "order_manager".into(),
                        payload: json!({"symbol": order.symbol, "price": order.actual_price, "quantity": self.position_quantity(&order.symbol)}),
                    })
                    .await;
            }
            PositionOutcome::Rejected(reason) => {
                debug!(symbol = %order.symbol, reason, "position update rejected");
            }
        }

        Ok(())
    }

    fn position_quantity(&self, symbol: &str) -> f64 {
        self.inner
            .lock()
            .positions
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(0.0)
    }

    /// Position update rules for BUY/SELL/SHORT/COVER. SELL requires a LONG
    /// position (old > 0) and clamps to flat rather than flipping to SHORT
    /// if the close quantity exceeds the open size; COVER is the mirror for
    /// SHORT. This is the explicit fix over the original source's bug.
    fn update_position_locked(inner: &mut Inner, order: &Order) -> EngineResult<PositionOutcome> {
        let position = inner
            .positions
            .entry(order.symbol.clone())
            .or_insert_with(|| Position::flat(order.symbol.clone()));

        let was_flat = position.is_flat();
        let delta = order.quantity;

        match order.side {
            OrderSide::Buy => {
                let old_qty = position.quantity;
                if old_qty < 0.0 {
                    // Closes (part of) an existing SHORT before possibly
                    // opening a LONG with the remainder, in the same fill.
                    let closing_qty = delta.min(-old_qty);
                    let realized = (position.average_price - order.actual_price) * closing_qty;
                    let new_qty = old_qty + delta;
                    position.quantity = new_qty;
                    position.average_price = order.actual_price;
                    position.leverage = order.leverage;
                    position.liquidation_price =
                        Position::calculate_liquidation_price(position.average_price, position.leverage, position.position_type());
                    if new_qty > 0.0 {
                        push_trade_history(inner, TradeHistoryEntry {
                            symbol: order.symbol.clone(),
                            realized_pnl: realized,
                            closed_at: order.updated_at,
                        });
                        return Ok(PositionOutcome::Flipped { realized_pnl: realized });
                    } else if new_qty == 0.0 {
                        *position = Position::flat(order.symbol.clone());
                        push_trade_history(inner, TradeHistoryEntry {
                            symbol: order.symbol.clone(),
                            realized_pnl: realized,
                            closed_at: order.updated_at,
                        });
                        return Ok(PositionOutcome::Closed { realized_pnl: realized });
                    }
                    return Ok(PositionOutcome::Updated);
                } else if old_qty == 0.0 {
                    position.quantity = delta;
                    position.average_price = order.actual_price;
                    position.leverage = order.leverage;
                    position.liquidation_price =
                        Position::calculate_liquidation_price(position.average_price, position.leverage, position.position_type());
                } else {
                    let new_qty = old_qty + delta;
                    position.average_price = (old_qty * position.average_price + delta * order.actual_price) / new_qty;
                    position.quantity = new_qty;
                    position.leverage = order.leverage;
                    position.liquidation_price =
                        Position::calculate_liquidation_price(position.average_price, position.leverage, position.position_type());
                }
            }
            OrderSide::Short => {
                let old_qty = position.quantity;
                if old_qty > 0.0 {
                    // Closes (part of) an existing LONG before possibly
                    // opening a SHORT with the remainder, in the same fill.
                    let closing_qty = delta.min(old_qty);
                    let realized = (order.actual_price - position.average_price) * closing_qty;
                    let new_qty = old_qty - delta;
                    position.quantity = new_qty;
                    position.average_price = order.actual_price;
                    position.leverage = order.leverage;
                    position.liquidation_price =
                        Position::calculate_liquidation_price(position.average_price, position.leverage, position.position_type());
                    if new_qty < 0.0 {
                        push_trade_history(inner, TradeHistoryEntry {
                            symbol: order.symbol.clone(),
                            realized_pnl: realized,
                            closed_at: order.updated_at,
                        });
                        return Ok(PositionOutcome::Flipped { realized_pnl: realized });
                    } else if new_qty == 0.0 {
                        *position = Position::flat(order.symbol.clone());
                        push_trade_history(inner, TradeHistoryEntry {
                            symbol: order.symbol.clone(),
                            realized_pnl: realized,
                            closed_at: order.updated_at,
                        });
                        return Ok(PositionOutcome::Closed { realized_pnl: realized });
                    }
                    return Ok(PositionOutcome::Updated);
                } else if old_qty == 0.0 {
                    position.quantity = -delta;
                    position.average_price = order.actual_price;
                    position.leverage = order.leverage;
                    position.liquidation_price =
                        Position::calculate_liquidation_price(position.average_price, position.leverage, position.position_type());
                } else {
                    let new_qty = old_qty - delta;
                    let old_abs = old_qty.abs();
                    let new_abs = new_qty.abs();
                    position.average_price = (old_abs * position.average_price + delta * order.actual_price) / new_abs;
                    position.quantity = new_qty;
                    position.leverage = order.leverage;
                    position.liquidation_price =
                        Position::calculate_liquidation_price(position.average_price, position.leverage, position.position_type());
                }
            }
            OrderSide::Sell => {
                if position.quantity <= 0.0 {
                    warn!(symbol = %order.symbol, "invalid_sell: no LONG position to sell");
                    return Ok(PositionOutcome::Rejected("invalid_sell"));
                }
                let entry = position.average_price;
                let closing_qty = delta.min(position.quantity);
                let realized = (order.actual_price - entry) * closing_qty;
                let new_qty = (position.quantity - delta).max(0.0);

                if new_qty <= 0.0 {
                    *position = Position::flat(order.symbol.clone());
                    push_trade_history(inner, TradeHistoryEntry {
                        symbol: order.symbol.clone(),
                        realized_pnl: realized,
                        closed_at: order.updated_at,
                    });
                    return Ok(PositionOutcome::Closed { realized_pnl: realized });
                } else {
                    position.quantity = new_qty;
                    position.liquidation_price =
                        Position::calculate_liquidation_price(position.average_price, position.leverage, position.position_type());
                    return Ok(PositionOutcome::Updated);
                }
            }
            OrderSide::Cover => {
                if position.quantity >= 0.0 {
                    warn!(symbol = %order.symbol, "invalid_cover: no SHORT position to cover");
                    return Ok(PositionOutcome::Rejected("invalid_cover"));
                }
                let entry = position.average_price;
                let closing_qty = delta.min(position.quantity.abs());
                let realized = (entry - order.actual_price) * closing_qty;
                let new_qty = (position.quantity + delta).min(0.0);

                if new_qty >= 0.0 {
                    *position = Position::flat(order.symbol.clone());
                    push_trade_history(inner, TradeHistoryEntry {
                        symbol: order.symbol.clone(),
                        realized_pnl: realized,
                        closed_at: order.updated_at,
                    });
                    return Ok(PositionOutcome::Closed { realized_pnl: realized });
                } else {
                    position.quantity = new_qty;
                    position.liquidation_price =
                        Position::calculate_liquidation_price(position.average_price, position.leverage, position.position_type());
                    return Ok(PositionOutcome::Updated);
                }
            }
        }

        let now_flat = position.is_flat();
        if was_flat && !now_flat {
            Ok(PositionOutcome::Opened)
        } else {
            Ok(PositionOutcome::Updated)
        }
    }

    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        self.inner.lock().positions.get(symbol).cloned()
    }

    pub fn trade_history_len(&self) -> usize {
        self.inner.lock().trade_history.len()
    }

    /// Dispatches SELL for LONG, COVER for SHORT. Returns `Ok(None)` if flat.
    pub async fn close_position(
        &self,
        symbol: &str,
        current_price: f64,
        strategy_name: &str,
        max_slippage_pct: f64,
    ) -> EngineResult<Option<Order>> {
        let (side, quantity, leverage) = {
            let inner = self.inner.lock();
            match inner.positions.get(symbol) {
                Some(p) if p.position_type() == PositionType::Long => (OrderSide::Sell, p.quantity, p.leverage),
                Some(p) if p.position_type() == PositionType::Short => (OrderSide::Cover, p.quantity.abs(), p.leverage),
                _ => return Ok(None),
            }
        };

        let order = self
            .submit_order(symbol, side, quantity, current_price, strategy_name, leverage, OrderKind::Market, max_slippage_pct)
            .await?;
        Ok(Some(order))
    }

    /// Thin wrapper over `close_position`, labeled distinctly for audit.
    pub async fn emergency_exit(
        &self,
        symbol: &str,
        current_price: f64,
        strategy_name: &str,
    ) -> EngineResult<Option<Order>> {
        debug!(symbol, "emergency_exit invoked");
        self.close_position(symbol, current_price, strategy_name, 0.0).await
    }

    pub async fn stop(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.event_bus.unsubscribe("signal_generated", id);
        }
        let mut inner = self.inner.lock();
        inner.orders.clear();
        inner.positions.clear();
    }
}

struct SignalGeneratedHandler(Arc<OrderManager>);

#[async_trait]
impl EventHandler for SignalGeneratedHandler {
    async fn handle(&self, event: &Event) {
        self.0.on_signal_generated(event).await;
    }
}

fn push_trade_history(inner: &mut Inner, entry: TradeHistoryEntry) {
    if inner.trade_history.len() >= inner.trade_history_cap {
        inner.trade_history.pop_front();
    }
    inner.trade_history.push_back(entry);
}

enum PositionOutcome {
    Opened,
    Updated,
    Closed { realized_pnl: f64 },
    Flipped { realized_pnl: f64 },
    Rejected(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> OrderManager {
        OrderManager::with_seed(EventBus::new(), 10_000, 42)
    }

    #[tokio::test]
    async fn buy_opens_long_position() {
        let om = manager();
        om.submit_order("BTCUSDT", OrderSide::Buy, 10.0, 50_000.0, "s", 1, OrderKind::Limit, 0.0)
            .await
            .unwrap();
        let pos = om.get_position("BTCUSDT").unwrap();
        assert_eq!(pos.quantity, 10.0);
        assert_eq!(pos.position_type(), PositionType::Long);
    }

    #[tokio::test]
    async fn sell_exceeding_long_clamps_to_flat_not_short() {
        let om = manager();
        om.submit_order("BTCUSDT", OrderSide::Buy, 10.0, 50_000.0, "s", 1, OrderKind::Limit, 0.0)
            .await
            .unwrap();
        om.submit_order("BTCUSDT", OrderSide::Sell, 20.0, 51_000.0, "s", 1, OrderKind::Limit, 0.0)
            .await
            .unwrap();
        let pos = om.get_position("BTCUSDT").unwrap();
        assert_eq!(pos.quantity, 0.0);
        assert_eq!(pos.position_type(), PositionType::None);
    }

    #[tokio::test]
    async fn sell_without_long_position_is_rejected() {
        let om = manager();
        om.submit_order("BTCUSDT", OrderSide::Sell, 1.0, 50_000.0, "s", 1, OrderKind::Limit, 0.0)
            .await
            .unwrap();
        assert!(om.get_position("BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn vwap_updates_average_price_on_add() {
        let om = manager();
        om.submit_order("ETHUSDT", OrderSide::Buy, 10.0, 2_000.0, "s", 1, OrderKind::Limit, 0.0)
            .await
            .unwrap();
        om.submit_order("ETHUSDT", OrderSide::Buy, 10.0, 3_000.0, "s", 1, OrderKind::Limit, 0.0)
            .await
            .unwrap();
        let pos = om.get_position("ETHUSDT").unwrap();
        assert!((pos.average_price - 2_500.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_slippage_fills_at_requested_price() {
        let om = manager();
        let order = om
            .submit_order("BTCUSDT", OrderSide::Buy, 1.0, 100.0, "s", 1, OrderKind::Market, 0.0)
            .await
            .unwrap();
        assert_eq!(order.actual_price, 100.0);
        assert_eq!(order.actual_slippage_pct, 0.0);
    }

    #[tokio::test]
    async fn validation_rejects_bad_inputs() {
        let om = manager();
        assert!(om.submit_order("", OrderSide::Buy, 1.0, 1.0, "s", 1, OrderKind::Market, 0.0).await.is_err());
        assert!(om.submit_order("X", OrderSide::Buy, -1.0, 1.0, "s", 1, OrderKind::Market, 0.0).await.is_err());
        assert!(om.submit_order("X", OrderSide::Buy, 1.0, 1.0, "s", 11, OrderKind::Market, 0.0).await.is_err());
    }

    #[tokio::test]
    async fn position_flip_via_short_after_long() {
        let om = manager();
        om.submit_order("BTCUSDT", OrderSide::Buy, 10.0, 50_000.0, "s", 1, OrderKind::Limit, 0.0)
            .await
            .unwrap();
        // SELL clamps; flipping to SHORT is done through a new SHORT order,
        // not by over-selling.
        om.submit_order("BTCUSDT", OrderSide::Sell, 10.0, 51_000.0, "s", 1, OrderKind::Limit, 0.0)
            .await
            .unwrap();
        om.submit_order("BTCUSDT", OrderSide::Short, 10.0, 51_000.0, "s", 1, OrderKind::Limit, 0.0)
            .await
            .unwrap();
        let pos = om.get_position("BTCUSDT").unwrap();
        assert_eq!(pos.quantity, -10.0);
    }

    #[tokio::test]
    async fn short_exceeding_long_flips_in_one_fill_with_realized_pnl() {
        let om = manager();
        om.submit_order("BTCUSDT", OrderSide::Buy, 10.0, 50_000.0, "s", 1, OrderKind::Limit, 0.0)
            .await
            .unwrap();
        om.submit_order("BTCUSDT", OrderSide::Short, 20.0, 51_000.0, "s", 1, OrderKind::Limit, 0.0)
            .await
            .unwrap();

        let pos = om.get_position("BTCUSDT").unwrap();
        assert_eq!(pos.quantity, -10.0);
        assert_eq!(pos.average_price, 51_000.0);
        assert_eq!(pos.position_type(), PositionType::Short);
        assert_eq!(om.trade_history_len(), 1);
    }
}
