//! Runtime configuration, loaded from the environment: `dotenv` then typed
//! `env::var` reads with hardcoded fallbacks. No schema-validation layer.

use std::env;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_ops_per_second: u32,
    pub max_ops_per_minute: u32,
    pub burst_size: u32,
    pub window_capacity: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_ops_per_second: 10,
            max_ops_per_minute: 300,
            burst_size: 50,
            window_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceLimitsConfig {
    pub max_sessions_per_client: u32,
    pub max_total_sessions: u32,
    pub max_symbols_per_session: u32,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_client: 5,
            max_total_sessions: 50,
            max_symbols_per_session: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_secs: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_secs: 60,
            success_threshold: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CooldownConfig {
    /// O1 cancellation cooldown before a strategy resumes MONITORING.
    pub signal_cancel_secs: u64,
    /// Normal ZE1 close-order exit cooldown.
    pub normal_exit_secs: u64,
    /// E1 emergency-exit cooldown, longer than a normal exit.
    pub emergency_exit_secs: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            signal_cancel_secs: 300,
            normal_exit_secs: 300,
            emergency_exit_secs: 1800,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionLifecycleConfig {
    pub heartbeat_interval_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub session_expiry_secs: u64,
}

impl Default for SessionLifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            inactivity_timeout_secs: 300,
            cleanup_interval_secs: 300,
            session_expiry_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub max_series: usize,
    pub max_counters: usize,
    pub max_gauges: usize,
    pub max_histograms: usize,
    pub max_histogram_samples: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            max_series: 1000,
            max_counters: 10_000,
            max_gauges: 5000,
            max_histograms: 1000,
            max_histogram_samples: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_signals: u32,
    pub max_evals_per_sec: u32,
    pub trade_history_cap: usize,
    pub rate_limiter: RateLimiterConfig,
    pub resource_limits: ResourceLimitsConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub cooldowns: CooldownConfig,
    pub session_lifecycle: SessionLifecycleConfig,
    pub telemetry: TelemetryConfig,
    pub db_path: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            max_concurrent_signals: env_or("MAX_CONCURRENT_SIGNALS", 3),
            max_evals_per_sec: env_or("MAX_EVALS_PER_SEC", 50),
            trade_history_cap: env_or("TRADE_HISTORY_CAP", 10_000),
            rate_limiter: RateLimiterConfig {
                max_ops_per_second: env_or("RATE_LIMIT_OPS_PER_SEC", 10),
                max_ops_per_minute: env_or("RATE_LIMIT_OPS_PER_MIN", 300),
                burst_size: env_or("RATE_LIMIT_BURST", 50),
                window_capacity: env_or("RATE_LIMIT_WINDOW_CAP", 1000),
            },
            resource_limits: ResourceLimitsConfig {
                max_sessions_per_client: env_or("MAX_SESSIONS_PER_CLIENT", 5),
                max_total_sessions: env_or("MAX_TOTAL_SESSIONS", 50),
                max_symbols_per_session: env_or("MAX_SYMBOLS_PER_SESSION", 20),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: env_or("CB_FAILURE_THRESHOLD", 5),
                timeout_secs: env_or("CB_TIMEOUT_SECS", 60),
                success_threshold: env_or("CB_SUCCESS_THRESHOLD", 3),
            },
            cooldowns: CooldownConfig {
                signal_cancel_secs: env_or("COOLDOWN_SIGNAL_CANCEL_SECS", 300),
                normal_exit_secs: env_or("COOLDOWN_NORMAL_EXIT_SECS", 300),
                emergency_exit_secs: env_or("COOLDOWN_EMERGENCY_EXIT_SECS", 1800),
            },
            session_lifecycle: SessionLifecycleConfig {
                heartbeat_interval_secs: env_or("SESSION_HEARTBEAT_SECS", 30),
                inactivity_timeout_secs: env_or("SESSION_INACTIVITY_TIMEOUT_SECS", 300),
                cleanup_interval_secs: env_or("SESSION_CLEANUP_INTERVAL_SECS", 300),
                session_expiry_secs: env_or("SESSION_EXPIRY_SECS", 86_400),
            },
            telemetry: TelemetryConfig::default(),
            db_path: env::var("STRATEGY_DB_PATH").unwrap_or_else(|_| "strategies.db".to_string()),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_signals: 3,
            max_evals_per_sec: 50,
            trade_history_cap: 10_000,
            rate_limiter: RateLimiterConfig::default(),
            resource_limits: ResourceLimitsConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cooldowns: CooldownConfig::default(),
            session_lifecycle: SessionLifecycleConfig::default(),
            telemetry: TelemetryConfig::default(),
            db_path: "strategies.db".to_string(),
        }
    }
}
