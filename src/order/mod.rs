pub mod manager;
pub mod types;

pub use manager::OrderManager;
pub use types::{Order, OrderKind, OrderSide, OrderStatus, Position, PositionType};
