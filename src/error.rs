//! Typed error taxonomy for the trading core.
//!
//! Component-boundary operations return `Result<T, EngineError>` so callers
//! can discriminate on kind; orchestration code further up wraps these in
//! `anyhow::Result` the way `main.rs` does.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad inputs to `submit_order` or strategy config. No state mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// SELL without LONG, COVER without SHORT. Order not executed.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Slot/symbol-lock/rate-limit denied. Strategy stays in current state.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Order Manager or Risk Manager raised. State reverts to pre-attempt.
    #[error("external error: {0}")]
    External(String),

    /// Invariant violation. Promoted to fatal at startup; isolated at runtime.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn resource_unavailable(msg: impl Into<String>) -> Self {
        Self::ResourceUnavailable(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Self::External(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
