//! Per-symbol circuit breaker, shared globally across sessions. Grounded on
//! `SymbolCircuitBreaker` in
//! `original_source/src/trading/session_manager.py`.

use chrono::{DateTime, Utc};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct SymbolCircuitBreaker {
    pub state: CircuitBreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
    failure_threshold: u32,
    timeout_secs: i64,
    success_threshold: u32,
}

impl SymbolCircuitBreaker {
    pub fn new(cfg: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
            failure_threshold: cfg.failure_threshold,
            timeout_secs: cfg.timeout_secs as i64,
            success_threshold: cfg.success_threshold,
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.last_failure_time = Some(now);
        match self.state {
            CircuitBreakerState::HalfOpen => {
                self.trip(now);
            }
            CircuitBreakerState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.trip(now);
                }
            }
            CircuitBreakerState::Open => {}
        }
    }

    fn trip(&mut self, now: DateTime<Utc>) {
        self.state = CircuitBreakerState::Open;
        self.success_count = 0;
        self.next_attempt_time = Some(now + chrono::Duration::seconds(self.timeout_secs));
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        match self.state {
            CircuitBreakerState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.success_threshold {
                    self.state = CircuitBreakerState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                }
            }
            CircuitBreakerState::Closed => {
                if self.failure_count > 0 {
                    self.failure_count -= 1;
                }
            }
            CircuitBreakerState::Open => {
                let _ = now;
            }
        }
    }

    /// Transitions OPEN → HALF_OPEN when `next_attempt_time` has passed, then
    /// reports whether an attempt may proceed.
    pub fn can_attempt(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => {
                if let Some(next) = self.next_attempt_time {
                    if now >= next {
                        self.state = CircuitBreakerState::HalfOpen;
                        self.success_count = 0;
                        return true;
                    }
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig { failure_threshold: 5, timeout_secs: 60, success_threshold: 3 }
    }

    #[test]
    fn trips_open_after_threshold_failures() {
        let mut cb = SymbolCircuitBreaker::new(&cfg());
        let now = Utc::now();
        for _ in 0..5 {
            cb.record_failure(now);
        }
        assert_eq!(cb.state, CircuitBreakerState::Open);
    }

    #[test]
    fn half_open_requires_consecutive_successes_to_close() {
        let mut cb = SymbolCircuitBreaker::new(&cfg());
        let now = Utc::now();
        for _ in 0..5 {
            cb.record_failure(now);
        }
        assert!(cb.can_attempt(now + chrono::Duration::seconds(61)));
        assert_eq!(cb.state, CircuitBreakerState::HalfOpen);
        cb.record_success(now);
        cb.record_success(now);
        assert_eq!(cb.state, CircuitBreakerState::HalfOpen);
        cb.record_success(now);
        assert_eq!(cb.state, CircuitBreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let mut cb = SymbolCircuitBreaker::new(&cfg());
        let now = Utc::now();
        for _ in 0..5 {
            cb.record_failure(now);
        }
        cb.can_attempt(now + chrono::Duration::seconds(61));
        cb.record_failure(now);
        assert_eq!(cb.state, CircuitBreakerState::Open);
    }

    #[test]
    fn closed_successes_decay_failure_count() {
        let mut cb = SymbolCircuitBreaker::new(&cfg());
        let now = Utc::now();
        cb.record_failure(now);
        cb.record_failure(now);
        cb.record_success(now);
        assert_eq!(cb.failure_count, 1);
    }
}
