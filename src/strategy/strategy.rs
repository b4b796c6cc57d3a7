//! `Strategy` and its state machine. Grounded on the `Strategy` dataclass and
//! `StrategyState` enum in `original_source/src/domain/services/strategy_manager.py`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::condition::ConditionGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyState {
    Inactive,
    Monitoring,
    SignalDetected,
    SignalCancelled,
    EntryEvaluation,
    PositionActive,
    CloseOrderEvaluation,
    EmergencyExit,
    Exited,
}

impl Default for StrategyState {
    fn default() -> Self {
        StrategyState::Inactive
    }
}

/// One point of the piecewise-linear interpolation tables used for
/// risk-adjusted position sizing and close-price adjustment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InterpolationPoint {
    pub risk_value: f64,
    pub multiplier: f64,
}

/// Evaluates a piecewise-linear function defined by `points`, clamped at the
/// endpoints, matching `_calculate_risk_adjustment_multiplier` /
/// `calculate_close_price_adjustment` in the original.
pub fn interpolate(points: &[InterpolationPoint], x: f64) -> f64 {
    if points.is_empty() {
        return 1.0;
    }
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.risk_value.partial_cmp(&b.risk_value).unwrap());

    if x <= sorted[0].risk_value {
        return sorted[0].multiplier;
    }
    if x >= sorted[sorted.len() - 1].risk_value {
        return sorted[sorted.len() - 1].multiplier;
    }
    for window in sorted.windows(2) {
        let (a, b) = (window[0], window[1]);
        if x >= a.risk_value && x <= b.risk_value {
            let span = b.risk_value - a.risk_value;
            if span == 0.0 {
                return a.multiplier;
            }
            let t = (x - a.risk_value) / span;
            return a.multiplier + t * (b.multiplier - a.multiplier);
        }
    }
    sorted[sorted.len() - 1].multiplier
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSizeType {
    Fixed,
    Percentage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizeSpec {
    pub size_type: PositionSizeType,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalLimits {
    pub base_position_pct: f64,
    pub max_position_pct: f64,
    pub min_position_pct: f64,
    pub max_leverage: u32,
    pub risk_adjustment_points: Vec<InterpolationPoint>,
    pub close_price_adjustment_points: Vec<InterpolationPoint>,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            base_position_pct: 0.02,
            max_position_pct: 0.10,
            min_position_pct: 0.005,
            max_leverage: 5,
            risk_adjustment_points: vec![
                InterpolationPoint { risk_value: 0.0, multiplier: 1.0 },
                InterpolationPoint { risk_value: 1.0, multiplier: 0.5 },
            ],
            close_price_adjustment_points: vec![
                InterpolationPoint { risk_value: 0.0, multiplier: 0.0 },
                InterpolationPoint { risk_value: 1.0, multiplier: -1.0 },
            ],
        }
    }
}

/// Transient, per-cycle bookkeeping the state machine mutates. Reset by
/// `reset_to_monitoring`.
#[derive(Debug, Clone, Default)]
pub struct RuntimeState {
    pub current_state: StrategyState,
    pub symbol: String,
    pub position_active: bool,
    pub signal_detection_time: Option<DateTime<Utc>>,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub cooldown_reason: Option<String>,
    /// Notional reserved against the risk budget while a position is open,
    /// released in full on exit (normal or emergency).
    pub reserved_notional: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub strategy_name: String,
    pub direction: Direction,
    pub enabled: bool,
    pub s1_signal: ConditionGroup,
    pub o1_cancel: ConditionGroup,
    pub z1_entry: ConditionGroup,
    pub ze1_close: ConditionGroup,
    pub e1_emergency: ConditionGroup,
    pub position_size: PositionSizeSpec,
    pub global_limits: GlobalLimits,

    #[serde(skip)]
    pub runtime: RuntimeStateWrapper,
}

/// `RuntimeState` isn't `Serialize`/`Deserialize` (it's transient, never
/// persisted); this wrapper gives `Strategy` a derivable `Clone`/`Debug`
/// while keeping `#[serde(skip)]` on the field above.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStateWrapper(pub RuntimeState);

impl Strategy {
    pub fn new(
        strategy_name: impl Into<String>,
        direction: Direction,
        s1_signal: ConditionGroup,
        o1_cancel: ConditionGroup,
        z1_entry: ConditionGroup,
        ze1_close: ConditionGroup,
        e1_emergency: ConditionGroup,
    ) -> Self {
        Self {
            strategy_name: strategy_name.into(),
            direction,
            enabled: true,
            s1_signal,
            o1_cancel,
            z1_entry,
            ze1_close,
            e1_emergency,
            position_size: PositionSizeSpec {
                size_type: PositionSizeType::Percentage,
                value: 0.02,
            },
            global_limits: GlobalLimits::default(),
            runtime: RuntimeStateWrapper(RuntimeState {
                current_state: StrategyState::Monitoring,
                ..Default::default()
            }),
        }
    }

    pub fn entry_action(&self) -> &'static str {
        match self.direction {
            Direction::Long | Direction::Both => "BUY",
            Direction::Short => "SHORT",
        }
    }

    pub fn exit_action(&self) -> &'static str {
        match self.direction {
            Direction::Long | Direction::Both => "SELL",
            Direction::Short => "COVER",
        }
    }

    pub fn reset_to_monitoring(&mut self) {
        self.runtime.0.current_state = StrategyState::Monitoring;
        self.runtime.0.signal_detection_time = None;
        self.runtime.0.entry_time = None;
        self.runtime.0.exit_time = None;
        self.runtime.0.cooldown_until = None;
        self.runtime.0.cooldown_reason = None;
        self.runtime.0.position_active = false;
        self.runtime.0.reserved_notional = 0.0;
    }
}
