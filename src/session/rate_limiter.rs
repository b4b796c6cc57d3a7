//! Global sliding-window rate limiter. The bounded-ring-of-timestamps shape
//! generalizes a per-IP window counter's `parking_lot::Mutex`-guarded
//! state + `check`-method idiom to a single global counter. The three-tier
//! (per-second/per-minute/burst) semantics and the `maxlen=1000` ring come
//! from `_check_global_rate_limit` in
//! `original_source/src/trading/session_manager.py`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::config::RateLimiterConfig;

struct State {
    timestamps: VecDeque<DateTime<Utc>>,
}

pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<State>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    ExceededPerSecond,
    ExceededPerMinute,
    ExceededBurst,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(State { timestamps: VecDeque::new() }),
        }
    }

    /// Checks the sliding window against all three limits and, if allowed,
    /// records this call as an operation. Bounded at `window_capacity`
    /// entries — unbounded growth here was the original's leak.
    pub fn check_and_record(&self, now: DateTime<Utc>) -> RateLimitDecision {
        let mut state = self.state.lock();

        while state.timestamps.len() >= self.cfg.window_capacity {
            state.timestamps.pop_front();
        }

        let one_sec_ago = now - chrono::Duration::seconds(1);
        let one_min_ago = now - chrono::Duration::minutes(1);

        let in_last_second = state.timestamps.iter().filter(|&&t| t > one_sec_ago).count() as u32;
        let in_last_minute = state.timestamps.iter().filter(|&&t| t > one_min_ago).count() as u32;

        if in_last_second >= self.cfg.burst_size {
            return RateLimitDecision::ExceededBurst;
        }
        if in_last_second >= self.cfg.max_ops_per_second {
            return RateLimitDecision::ExceededPerSecond;
        }
        if in_last_minute >= self.cfg.max_ops_per_minute {
            return RateLimitDecision::ExceededPerMinute;
        }

        state.timestamps.push_back(now);
        RateLimitDecision::Allowed
    }

    pub fn window_len(&self) -> usize {
        self.state.lock().timestamps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RateLimiterConfig {
        RateLimiterConfig { max_ops_per_second: 10, max_ops_per_minute: 300, burst_size: 50, window_capacity: 1000 }
    }

    #[test]
    fn allows_under_limit() {
        let limiter = RateLimiter::new(cfg());
        let now = Utc::now();
        for _ in 0..10 {
            assert_eq!(limiter.check_and_record(now), RateLimitDecision::Allowed);
        }
        assert_eq!(limiter.check_and_record(now), RateLimitDecision::ExceededPerSecond);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let mut small = cfg();
        small.window_capacity = 5;
        small.max_ops_per_second = 1000;
        small.max_ops_per_minute = 1000;
        small.burst_size = 1000;
        let limiter = RateLimiter::new(small);
        let now = Utc::now();
        for i in 0..20 {
            limiter.check_and_record(now - chrono::Duration::seconds(20 - i));
        }
        assert!(limiter.window_len() <= 5);
    }

    #[test]
    fn burst_cap_enforced() {
        let mut c = cfg();
        c.max_ops_per_second = 1000;
        c.burst_size = 3;
        let limiter = RateLimiter::new(c);
        let now = Utc::now();
        for _ in 0..3 {
            assert_eq!(limiter.check_and_record(now), RateLimitDecision::Allowed);
        }
        assert_eq!(limiter.check_and_record(now), RateLimitDecision::ExceededBurst);
    }
}
