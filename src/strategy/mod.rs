pub mod condition;
pub mod manager;
pub mod persistence;
pub mod strategy;

pub use condition::{Condition, ConditionGroup, ConditionResult, ConditionValue, Operator};
pub use manager::StrategyManager;
pub use persistence::{SqliteStrategyStore, StrategyStore};
pub use strategy::{
    interpolate, Direction, GlobalLimits, InterpolationPoint, PositionSizeSpec, PositionSizeType, RuntimeState,
    Strategy, StrategyState,
};
