//! Risk management: Kelly position sizing, VaR/CVaR, drawdown throttling,
//! and isotonic-style confidence calibration, wrapped behind the
//! budget-based collaborator interface the Strategy Manager calls
//! (`get_available_capital`, `assess_position_risk`, `can_open_position_sync`,
//! `use_budget`, `release_budget`). The budget bookkeeping is reconstructed
//! from call sites in the original `strategy_manager.py` (no standalone
//! `risk_manager.py` survived source filtering).

use std::collections::{HashMap, VecDeque};
use std::ops::Range;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

const MAX_KELLY_CAP: f64 = 0.20;
const DRAWDOWN_THROTTLE_TRIGGER: f64 = 0.08;
const DRAWDOWN_THROTTLE_RELEASE: f64 = 0.04;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellyCalculator {
    pub fraction: f64,
    pub bankroll: f64,
    win_history: VecDeque<bool>,
    max_history: usize,
}

impl KellyCalculator {
    pub fn new(bankroll: f64, fraction: f64) -> Self {
        Self {
            fraction: fraction.clamp(0.1, 0.5),
            bankroll,
            win_history: VecDeque::with_capacity(1000),
            max_history: 1000,
        }
    }

    pub fn raw_fraction(&self, win_probability: f64) -> f64 {
        let p = win_probability.clamp(0.001, 0.999);
        let q = 1.0 - p;
        let b = (1.0 / p) - 1.0;
        if b <= 0.0 {
            return 0.0;
        }
        ((b * p - q) / b).max(0.0)
    }

    pub fn update_history(&mut self, won: bool) {
        if self.win_history.len() >= self.max_history {
            self.win_history.pop_front();
        }
        self.win_history.push_back(won);
    }

    pub fn get_win_rate(&self) -> f64 {
        if self.win_history.is_empty() {
            return 0.5;
        }
        let wins = self.win_history.iter().filter(|&&w| w).count() as f64;
        wins / self.win_history.len() as f64
    }

    pub fn apply_pnl(&mut self, pnl: f64) {
        self.bankroll = (self.bankroll + pnl).max(0.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaRCalculator {
    historical_pnl: VecDeque<f64>,
    confidence_level: f64,
    max_history: usize,
}

impl VaRCalculator {
    pub fn new(confidence_level: f64) -> Self {
        Self {
            historical_pnl: VecDeque::with_capacity(10_000),
            confidence_level: confidence_level.clamp(0.9, 0.99),
            max_history: 10_000,
        }
    }

    pub fn add_pnl(&mut self, pnl: f64) {
        if self.historical_pnl.len() >= self.max_history {
            self.historical_pnl.pop_front();
        }
        self.historical_pnl.push_back(pnl);
    }

    pub fn calculate_var(&self) -> f64 {
        if self.historical_pnl.len() < 100 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.historical_pnl.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = ((1.0 - self.confidence_level) * sorted.len() as f64) as usize;
        -sorted[index]
    }

    pub fn calculate_cvar(&self) -> f64 {
        if self.historical_pnl.len() < 100 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.historical_pnl.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let var_index = ((1.0 - self.confidence_level) * sorted.len() as f64) as usize;
        let tail = &sorted[..=var_index];
        if tail.is_empty() {
            return 0.0;
        }
        -(tail.iter().sum::<f64>() / tail.len() as f64)
    }
}

#[derive(Debug, Clone)]
struct CalibrationBin {
    range: Range<f64>,
    wins: u32,
    total: u32,
}

impl CalibrationBin {
    fn new(lower: f64, upper: f64) -> Self {
        Self { range: lower..upper, wins: 0, total: 0 }
    }

    fn contains(&self, value: f64) -> bool {
        value >= self.range.start && value < self.range.end
    }

    fn observe(&mut self, won: bool) {
        self.total += 1;
        if won {
            self.wins += 1;
        }
    }

    fn calibrated_probability(&self, fallback: f64) -> f64 {
        if self.total < 5 {
            return fallback;
        }
        (self.wins as f64 / self.total as f64).clamp(0.01, 0.99)
    }
}

#[derive(Debug, Clone)]
struct CalibrationModel {
    version: String,
    bins: Vec<CalibrationBin>,
    sample_size: u32,
}

impl CalibrationModel {
    fn new(version: &str, bin_count: usize) -> Self {
        let step = 1.0 / bin_count as f64;
        let mut bins = Vec::with_capacity(bin_count);
        for i in 0..bin_count {
            let lower = i as f64 * step;
            let upper = if i == bin_count - 1 { 1.0 + f64::EPSILON } else { (i + 1) as f64 * step };
            bins.push(CalibrationBin::new(lower, upper));
        }
        Self { version: version.to_string(), bins, sample_size: 0 }
    }

    fn calibrate(&self, raw: f64) -> f64 {
        let fallback = raw.clamp(0.01, 0.99);
        self.bins
            .iter()
            .find(|bin| bin.contains(raw))
            .map(|bin| bin.calibrated_probability(fallback))
            .unwrap_or(fallback)
    }

    fn observe(&mut self, raw: f64, won: bool) {
        if let Some(bin) = self.bins.iter_mut().find(|b| b.contains(raw)) {
            bin.observe(won);
            self.sample_size += 1;
            if self.sample_size % 250 == 0 {
                self.version = format!("iso-v1-{}", self.sample_size);
            }
        }
    }

    fn summary(&self, family: &str) -> CalibrationSummary {
        CalibrationSummary {
            signal_family: family.to_string(),
            version: self.version.clone(),
            sample_size: self.sample_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub signal_family: String,
    pub version: String,
    pub sample_size: u32,
}

#[derive(Debug, Default)]
struct CalibrationRegistry {
    models: HashMap<String, CalibrationModel>,
}

impl CalibrationRegistry {
    fn ensure_model(&mut self, family: &str) -> &mut CalibrationModel {
        self.models
            .entry(family.to_string())
            .or_insert_with(|| CalibrationModel::new("iso-v1", 100))
    }

    fn calibrate(&mut self, family: &str, raw: f64) -> (f64, String) {
        let model = self.ensure_model(family);
        (model.calibrate(raw), model.version.clone())
    }

    fn observe(&mut self, family: &str, raw: f64, won: bool) {
        self.ensure_model(family).observe(raw, won);
    }

    fn summaries(&self) -> Vec<CalibrationSummary> {
        let mut summaries: Vec<_> = self.models.iter().map(|(f, m)| m.summary(f)).collect();
        summaries.sort_by(|a, b| a.signal_family.cmp(&b.signal_family));
        summaries
    }
}

#[derive(Debug, Clone)]
struct DrawdownMonitor {
    equity: f64,
    peak: f64,
    max_drawdown: f64,
    current_drawdown: f64,
    throttle_active: bool,
}

impl DrawdownMonitor {
    fn new(initial_equity: f64) -> Self {
        Self { equity: initial_equity, peak: initial_equity, max_drawdown: 0.0, current_drawdown: 0.0, throttle_active: false }
    }

    fn record(&mut self, equity: f64) {
        self.equity = equity.max(0.0);
        if self.equity > self.peak {
            self.peak = self.equity;
        }
        if self.peak > 0.0 {
            self.current_drawdown = ((self.peak - self.equity) / self.peak).clamp(0.0, 1.0);
            if self.current_drawdown > self.max_drawdown {
                self.max_drawdown = self.current_drawdown;
            }
        }
        if self.current_drawdown >= DRAWDOWN_THROTTLE_TRIGGER {
            self.throttle_active = true;
        } else if self.current_drawdown <= DRAWDOWN_THROTTLE_RELEASE {
            self.throttle_active = false;
        }
    }

    fn multiplier(&self) -> f64 {
        if self.throttle_active { 0.5 } else { 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRiskAssessment {
    pub approved: bool,
    pub recommended_notional: f64,
    pub risk_level: RiskLevel,
    pub var_95: f64,
    pub cvar_95: f64,
    pub calibrated_confidence: f64,
    pub calibration_version: String,
    pub drawdown_multiplier: f64,
    pub guardrail_flags: Vec<String>,
}

struct Inner {
    kelly: KellyCalculator,
    var: VaRCalculator,
    drawdown: DrawdownMonitor,
    calibration: CalibrationRegistry,
    reserved_budget: f64,
    initial_capital: f64,
}

/// Collaborator interface the Strategy Manager's `ENTRY_EVALUATION` step
/// calls through. Reconstructed from usage in the original
/// `strategy_manager.py` (`get_available_capital`, `initial_capital`,
/// `assess_position_risk`, `can_open_position_sync`, `use_budget`,
/// `release_budget`).
#[async_trait]
pub trait RiskManager: Send + Sync {
    fn initial_capital(&self) -> f64;
    async fn get_available_capital(&self) -> f64;
    async fn assess_position_risk(
        &self,
        signal_family: &str,
        confidence: f64,
        notional: f64,
    ) -> EngineResult<PositionRiskAssessment>;
    fn can_open_position_sync(&self, notional: f64) -> bool;
    async fn use_budget(&self, amount: f64) -> EngineResult<()>;
    async fn release_budget(&self, amount: f64);
    async fn update_trade_outcome(&self, pnl: f64, won: bool, signal_family: &str, raw_confidence: f64);
}

pub struct DefaultRiskManager {
    inner: Mutex<Inner>,
}

impl DefaultRiskManager {
    pub fn new(initial_capital: f64, kelly_fraction: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                kelly: KellyCalculator::new(initial_capital, kelly_fraction),
                var: VaRCalculator::new(0.95),
                drawdown: DrawdownMonitor::new(initial_capital),
                calibration: CalibrationRegistry::default(),
                reserved_budget: 0.0,
                initial_capital,
            }),
        }
    }
}

#[async_trait]
impl RiskManager for DefaultRiskManager {
    fn initial_capital(&self) -> f64 {
        self.inner.lock().initial_capital
    }

    async fn get_available_capital(&self) -> f64 {
        let inner = self.inner.lock();
        (inner.kelly.bankroll - inner.reserved_budget).max(0.0)
    }

    async fn assess_position_risk(
        &self,
        signal_family: &str,
        confidence: f64,
        notional: f64,
    ) -> EngineResult<PositionRiskAssessment> {
        let mut inner = self.inner.lock();
        let (calibrated_confidence, calibration_version) =
            inner.calibration.calibrate(signal_family, confidence);

        let raw_fraction = inner.kelly.raw_fraction(calibrated_confidence);
        let capped_fraction = raw_fraction.min(MAX_KELLY_CAP);
        let drawdown_multiplier = inner.drawdown.multiplier();
        let effective_fraction = capped_fraction * inner.kelly.fraction * drawdown_multiplier;
        let recommended_notional = inner.kelly.bankroll * effective_fraction;

        let var_95 = inner.var.calculate_var();
        let cvar_95 = inner.var.calculate_cvar();

        let mut guardrail_flags = Vec::new();
        if raw_fraction > MAX_KELLY_CAP {
            guardrail_flags.push("kelly_cap".to_string());
        }
        if drawdown_multiplier < 1.0 {
            guardrail_flags.push("drawdown_throttle".to_string());
        }

        let bankroll = inner.kelly.bankroll;
        let position_pct = if bankroll > 0.0 { notional / bankroll } else { 0.0 };
        let var_pct = if bankroll > 0.0 { var_95 / bankroll } else { 0.0 };
        let risk_level = if position_pct > 0.1 || var_pct > 0.05 {
            RiskLevel::High
        } else if position_pct > 0.05 || var_pct > 0.03 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let approved = notional <= recommended_notional.max(bankroll * MAX_KELLY_CAP)
            && !matches!(risk_level, RiskLevel::High);

        Ok(PositionRiskAssessment {
            approved,
            recommended_notional,
            risk_level,
            var_95,
            cvar_95,
            calibrated_confidence,
            calibration_version,
            drawdown_multiplier,
            guardrail_flags,
        })
    }

    fn can_open_position_sync(&self, notional: f64) -> bool {
        let inner = self.inner.lock();
        (inner.kelly.bankroll - inner.reserved_budget) >= notional
    }

    async fn use_budget(&self, amount: f64) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let available = inner.kelly.bankroll - inner.reserved_budget;
        if amount > available {
            return Err(EngineError::resource_unavailable(format!(
                "insufficient budget: requested {amount}, available {available}"
            )));
        }
        inner.reserved_budget += amount;
        Ok(())
    }

    async fn release_budget(&self, amount: f64) {
        let mut inner = self.inner.lock();
        inner.reserved_budget = (inner.reserved_budget - amount).max(0.0);
    }

    async fn update_trade_outcome(&self, pnl: f64, won: bool, signal_family: &str, raw_confidence: f64) {
        let mut inner = self.inner.lock();
        inner.var.add_pnl(pnl);
        inner.kelly.update_history(won);
        inner.kelly.apply_pnl(pnl);
        let bankroll = inner.kelly.bankroll;
        inner.drawdown.record(bankroll);
        inner.calibration.observe(signal_family, raw_confidence, won);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kelly_fraction_is_capped() {
        let rm = DefaultRiskManager::new(10_000.0, 0.5);
        let rec = rm.assess_position_risk("test", 0.9, 500.0).await.unwrap();
        assert!(rec.calibrated_confidence <= 0.99);
    }

    #[tokio::test]
    async fn drawdown_throttle_flags() {
        let rm = DefaultRiskManager::new(10_000.0, 0.5);
        rm.update_trade_outcome(-1_500.0, false, "test", 0.6).await;
        let rec = rm.assess_position_risk("test", 0.6, 100.0).await.unwrap();
        assert!(rec.drawdown_multiplier <= 1.0);
    }

    #[tokio::test]
    async fn use_budget_rejects_over_capital() {
        let rm = DefaultRiskManager::new(1_000.0, 0.25);
        assert!(rm.use_budget(500.0).await.is_ok());
        assert!(rm.use_budget(600.0).await.is_err());
    }

    #[tokio::test]
    async fn release_budget_restores_availability() {
        let rm = DefaultRiskManager::new(1_000.0, 0.25);
        rm.use_budget(500.0).await.unwrap();
        rm.release_budget(500.0).await;
        assert_eq!(rm.get_available_capital().await, 1_000.0);
    }

    #[test]
    fn calibration_updates_version_after_enough_samples() {
        let mut registry = CalibrationRegistry::default();
        for _ in 0..260 {
            registry.observe("test_family", 0.55, true);
        }
        let summary = registry
            .summaries()
            .into_iter()
            .find(|s| s.signal_family == "test_family")
            .unwrap();
        assert!(summary.version.starts_with("iso-v1-"));
    }
}
