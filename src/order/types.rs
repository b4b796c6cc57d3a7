//! Order/position value types. Grounded on the `OrderType`/`OrderRecord`/
//! `PositionRecord` shapes in
//! `original_source/src/domain/services/order_manager.py`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
    Short,
    Cover,
}

impl OrderSide {
    pub fn is_opening(&self) -> bool {
        matches!(self, OrderSide::Buy | OrderSide::Short)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, OrderSide::Sell | OrderSide::Cover)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionType {
    Long,
    Short,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub requested_price: f64,
    pub actual_price: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub strategy_name: String,
    pub leverage: u32,
    pub order_kind: OrderKind,
    pub max_slippage_pct: f64,
    pub actual_slippage_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub average_price: f64,
    pub leverage: u32,
    pub liquidation_price: Option<f64>,
}

impl Position {
    pub fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: 0.0,
            average_price: 0.0,
            leverage: 1,
            liquidation_price: None,
        }
    }

    pub fn position_type(&self) -> PositionType {
        if self.quantity > 0.0 {
            PositionType::Long
        } else if self.quantity < 0.0 {
            PositionType::Short
        } else {
            PositionType::None
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0.0
    }

    /// LONG: entry·(1 − 1/L); SHORT: entry·(1 + 1/L); None if L == 1.
    pub fn calculate_liquidation_price(entry: f64, leverage: u32, position_type: PositionType) -> Option<f64> {
        if leverage <= 1 {
            return None;
        }
        let l = leverage as f64;
        match position_type {
            PositionType::Long => Some(entry * (1.0 - 1.0 / l)),
            PositionType::Short => Some(entry * (1.0 + 1.0 / l)),
            PositionType::None => None,
        }
    }

    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        match self.position_type() {
            PositionType::Long => (mark_price - self.average_price) * self.quantity,
            PositionType::Short => (self.average_price - mark_price) * self.quantity.abs(),
            PositionType::None => 0.0,
        }
    }

    pub fn unrealized_pnl_pct(&self, mark_price: f64) -> f64 {
        if self.average_price <= 0.0 || mark_price <= 0.0 {
            return 0.0;
        }
        let notional = self.average_price * self.quantity.abs();
        if notional <= 0.0 {
            return 0.0;
        }
        (self.unrealized_pnl(mark_price) / notional) * 100.0
    }
}
