//! Condition/ConditionGroup evaluation. Grounded on `ConditionGroup.evaluate`
//! and `Condition.evaluate` in the original `strategy_manager.py`: operators
//! are parsed once at construction (never string-dispatched per evaluation),
//! indicator lookup is case-insensitive, and an empty group is FALSE — the
//! exact bugfix the original's history records and this keeps fixed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Gte,
    Lte,
    Gt,
    Lt,
    Eq,
    Between,
    Allowed,
}

impl Operator {
    /// Accepts both the spoken forms (`gte`, `between`) and the symbolic
    /// synonyms (`>=`, `<=`, `>`, `<`, `==`, `=`) the legacy schema uses.
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gte" | ">=" => Ok(Operator::Gte),
            "lte" | "<=" => Ok(Operator::Lte),
            "gt" | ">" => Ok(Operator::Gt),
            "lt" | "<" => Ok(Operator::Lt),
            "eq" | "==" | "=" => Ok(Operator::Eq),
            "between" => Ok(Operator::Between),
            "allowed" => Ok(Operator::Allowed),
            other => Err(format!("unknown operator: {other}")),
        }
    }
}

/// The right-hand side of a condition. `Between` and `Allowed` need more
/// than a single scalar, so this is a small tagged union rather than a bare
/// `f64`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Scalar(f64),
    Range(f64, f64),
    Set(Vec<f64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionResult {
    True,
    False,
    Pending,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    pub condition_type: String,
    pub operator: Operator,
    pub value: ConditionValue,
    pub enabled: bool,
    /// Operator UX only; never evaluated. Round-trips through persistence.
    pub description: String,
}

impl Condition {
    pub fn new(
        name: impl Into<String>,
        condition_type: impl Into<String>,
        operator_raw: &str,
        value: ConditionValue,
    ) -> Result<Self, String> {
        Ok(Self {
            name: name.into(),
            condition_type: condition_type.into(),
            operator: Operator::parse(operator_raw)?,
            value,
            enabled: true,
            description: String::new(),
        })
    }

    /// Looks up `condition_type` case-insensitively in `indicators` and
    /// compares. Absent key is PENDING (the source may simply not have
    /// produced that indicator yet); any panic-shaped failure is ERROR.
    pub fn evaluate(&self, indicators: &HashMap<String, f64>) -> ConditionResult {
        if !self.enabled {
            return ConditionResult::False;
        }
        let key = self.condition_type.to_ascii_lowercase();
        let Some(&observed) = indicators.get(&key) else {
            return ConditionResult::Pending;
        };

        match (self.operator, &self.value) {
            (Operator::Gte, ConditionValue::Scalar(v)) => bool_result(observed >= *v),
            (Operator::Lte, ConditionValue::Scalar(v)) => bool_result(observed <= *v),
            (Operator::Gt, ConditionValue::Scalar(v)) => bool_result(observed > *v),
            (Operator::Lt, ConditionValue::Scalar(v)) => bool_result(observed < *v),
            (Operator::Eq, ConditionValue::Scalar(v)) => bool_result(observed == *v),
            (Operator::Between, ConditionValue::Range(lo, hi)) => {
                bool_result(observed >= *lo && observed <= *hi)
            }
            (Operator::Allowed, ConditionValue::Set(set)) => {
                bool_result(set.iter().any(|v| *v == observed))
            }
            _ => ConditionResult::Error,
        }
    }
}

fn bool_result(b: bool) -> ConditionResult {
    if b {
        ConditionResult::True
    } else {
        ConditionResult::False
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub name: String,
    pub conditions: Vec<Condition>,
    pub require_all: bool,
}

impl ConditionGroup {
    pub fn new(name: impl Into<String>, conditions: Vec<Condition>, require_all: bool) -> Self {
        Self {
            name: name.into(),
            conditions,
            require_all,
        }
    }

    /// Empty groups are FALSE, never TRUE — the invariant the original's
    /// history got wrong once and this must not regress.
    pub fn evaluate(&self, indicators: &HashMap<String, f64>) -> ConditionResult {
        let enabled: Vec<&Condition> = self.conditions.iter().filter(|c| c.enabled).collect();
        if enabled.is_empty() {
            return ConditionResult::False;
        }

        let results: Vec<ConditionResult> = enabled.iter().map(|c| c.evaluate(indicators)).collect();

        if results.iter().any(|r| *r == ConditionResult::Error) {
            return ConditionResult::Error;
        }

        if self.require_all {
            if results.iter().any(|r| *r == ConditionResult::Pending) {
                return ConditionResult::Pending;
            }
            bool_result(results.iter().all(|r| *r == ConditionResult::True))
        } else {
            if results.iter().any(|r| *r == ConditionResult::True) {
                return ConditionResult::True;
            }
            if results.iter().any(|r| *r == ConditionResult::Pending) {
                return ConditionResult::Pending;
            }
            ConditionResult::False
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ind(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn empty_group_is_false() {
        let group = ConditionGroup::new("s1", vec![], true);
        assert_eq!(group.evaluate(&ind(&[])), ConditionResult::False);
    }

    #[test]
    fn require_all_needs_every_condition_true() {
        let c1 = Condition::new("a", "pump_magnitude_pct", ">=", ConditionValue::Scalar(5.0)).unwrap();
        let c2 = Condition::new("b", "volume_surge_ratio", ">=", ConditionValue::Scalar(2.0)).unwrap();
        let group = ConditionGroup::new("s1", vec![c1, c2], true);

        assert_eq!(
            group.evaluate(&ind(&[("pump_magnitude_pct", 7.5), ("volume_surge_ratio", 3.0)])),
            ConditionResult::True
        );
        assert_eq!(
            group.evaluate(&ind(&[("pump_magnitude_pct", 7.5), ("volume_surge_ratio", 1.0)])),
            ConditionResult::False
        );
    }

    #[test]
    fn missing_indicator_is_pending() {
        let c1 = Condition::new("a", "pump_magnitude_pct", ">=", ConditionValue::Scalar(5.0)).unwrap();
        let group = ConditionGroup::new("s1", vec![c1], true);
        assert_eq!(group.evaluate(&ind(&[])), ConditionResult::Pending);
    }

    #[test]
    fn between_is_inclusive() {
        let c1 = Condition::new("a", "risk", "between", ConditionValue::Range(1.0, 5.0)).unwrap();
        let group = ConditionGroup::new("g", vec![c1], true);
        assert_eq!(group.evaluate(&ind(&[("risk", 1.0)])), ConditionResult::True);
        assert_eq!(group.evaluate(&ind(&[("risk", 5.0)])), ConditionResult::True);
        assert_eq!(group.evaluate(&ind(&[("risk", 5.1)])), ConditionResult::False);
    }

    #[test]
    fn unknown_operator_is_rejected_at_construction() {
        let err = Condition::new("a", "x", "wat", ConditionValue::Scalar(1.0)).unwrap_err();
        assert!(err.contains("unknown operator"));
    }

    #[test]
    fn any_of_short_circuits_on_true() {
        let c1 = Condition::new("a", "x", ">=", ConditionValue::Scalar(5.0)).unwrap();
        let c2 = Condition::new("b", "y", ">=", ConditionValue::Scalar(5.0)).unwrap();
        let group = ConditionGroup::new("g", vec![c1, c2], false);
        assert_eq!(group.evaluate(&ind(&[("x", 10.0)])), ConditionResult::True);
    }

    #[test]
    fn error_propagates_regardless_of_require_all() {
        let c1 = Condition::new("a", "x", "between", ConditionValue::Scalar(5.0)).unwrap();
        let group = ConditionGroup::new("g", vec![c1], true);
        assert_eq!(group.evaluate(&ind(&[("x", 1.0)])), ConditionResult::Error);
    }
}
