//! Pump-and-dump detection and execution engine.
//!
//! Exposes the core modules so binaries and integration tests can drive the
//! engine without going through `main`.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod market_adapter;
pub mod order;
pub mod risk;
pub mod session;
pub mod strategy;
pub mod telemetry;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use event_bus::{Event, EventBus, EventHandler, SubscriptionId};
