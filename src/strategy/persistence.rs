//! Strategy persistence: an opaque store behind `save`/`load_enabled`/
//! `soft_delete`. Loading must accept both the legacy section keys
//! (`signal_detection`, `signal_cancellation`, `entry_conditions`,
//! `close_order_detection`) and the modern keys (`s1_signal`, `o1_cancel`,
//! `z1_entry`, `ze1_close`), and always writes modern keys on save.
//! `emergency_exit` is spelled the same in both schemas.
//!
//! Uses `rusqlite` (`bundled`) for local storage. Table shape is minimal:
//! one JSON blob column per strategy, the way a KV-shaped opaque store
//! would be implemented on top of SQLite.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::{json, Value};

use crate::error::{EngineError, EngineResult};

use super::condition::{Condition, ConditionGroup, ConditionValue, Operator};
use super::strategy::{
    Direction, GlobalLimits, InterpolationPoint, PositionSizeSpec, PositionSizeType, Strategy,
};

#[async_trait]
pub trait StrategyStore: Send + Sync {
    async fn save(&self, strategy: &Strategy) -> EngineResult<()>;
    async fn load_enabled(&self) -> EngineResult<Vec<Strategy>>;
    async fn soft_delete(&self, name: &str) -> EngineResult<()>;
}

pub struct SqliteStrategyStore {
    conn: parking_lot::Mutex<Connection>,
}

impl SqliteStrategyStore {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| EngineError::internal(format!("opening strategy store: {e}")))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS strategies (
                name TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL,
                document TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| EngineError::internal(format!("creating strategy table: {e}")))?;
        Ok(Self {
            conn: parking_lot::Mutex::new(conn),
        })
    }

    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::internal(format!("opening in-memory store: {e}")))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS strategies (
                name TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL,
                document TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| EngineError::internal(format!("creating strategy table: {e}")))?;
        Ok(Self {
            conn: parking_lot::Mutex::new(conn),
        })
    }
}

#[async_trait]
impl StrategyStore for SqliteStrategyStore {
    async fn save(&self, strategy: &Strategy) -> EngineResult<()> {
        let doc = strategy_to_json(strategy);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO strategies (name, enabled, document) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET enabled = excluded.enabled, document = excluded.document",
            params![strategy.strategy_name, strategy.enabled as i64, doc.to_string()],
        )
        .map_err(|e| EngineError::external(format!("saving strategy: {e}")))?;
        Ok(())
    }

    async fn load_enabled(&self) -> EngineResult<Vec<Strategy>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT document FROM strategies WHERE enabled = 1")
            .map_err(|e| EngineError::external(format!("preparing load: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| EngineError::external(format!("querying strategies: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| EngineError::external(format!("reading row: {e}")))?;
            let value: Value = serde_json::from_str(&raw)
                .map_err(|e| EngineError::external(format!("parsing strategy json: {e}")))?;
            out.push(strategy_from_json(&value)?);
        }
        Ok(out)
    }

    async fn soft_delete(&self, name: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE strategies SET enabled = 0 WHERE name = ?1",
            params![name],
        )
        .map_err(|e| EngineError::external(format!("soft-deleting strategy: {e}")))?;
        Ok(())
    }
}

fn group_to_json(group: &ConditionGroup) -> Value {
    json!({
        "conditions": group.conditions.iter().map(condition_to_json).collect::<Vec<_>>(),
        "require_all": group.require_all,
    })
}

fn condition_to_json(c: &Condition) -> Value {
    let (operator, value) = match (c.operator, &c.value) {
        (Operator::Gte, ConditionValue::Scalar(v)) => ("gte", json!(v)),
        (Operator::Lte, ConditionValue::Scalar(v)) => ("lte", json!(v)),
        (Operator::Gt, ConditionValue::Scalar(v)) => ("gt", json!(v)),
        (Operator::Lt, ConditionValue::Scalar(v)) => ("lt", json!(v)),
        (Operator::Eq, ConditionValue::Scalar(v)) => ("eq", json!(v)),
        (Operator::Between, ConditionValue::Range(lo, hi)) => ("between", json!([lo, hi])),
        (Operator::Allowed, ConditionValue::Set(set)) => ("allowed", json!(set)),
        _ => ("eq", json!(0.0)),
    };
    json!({
        "name": c.name,
        "condition_type": c.condition_type,
        "operator": operator,
        "value": value,
        "enabled": c.enabled,
        "description": c.description,
    })
}

/// Always writes the modern section keys.
pub fn strategy_to_json(strategy: &Strategy) -> Value {
    json!({
        "strategy_name": strategy.strategy_name,
        "direction": match strategy.direction {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
            Direction::Both => "BOTH",
        },
        "enabled": strategy.enabled,
        "s1_signal": group_to_json(&strategy.s1_signal),
        "o1_cancel": group_to_json(&strategy.o1_cancel),
        "z1_entry": group_to_json(&strategy.z1_entry),
        "ze1_close": group_to_json(&strategy.ze1_close),
        "emergency_exit": group_to_json(&strategy.e1_emergency),
        "position_size": {
            "type": match strategy.position_size.size_type {
                PositionSizeType::Fixed => "fixed",
                PositionSizeType::Percentage => "percentage",
            },
            "value": strategy.position_size.value,
        },
        "global_limits": {
            "base_position_pct": strategy.global_limits.base_position_pct,
            "max_position_pct": strategy.global_limits.max_position_pct,
            "min_position_pct": strategy.global_limits.min_position_pct,
            "max_leverage": strategy.global_limits.max_leverage,
            "risk_adjustment_points": strategy.global_limits.risk_adjustment_points.iter()
                .map(|p| json!({"risk_value": p.risk_value, "multiplier": p.multiplier}))
                .collect::<Vec<_>>(),
            "close_price_adjustment_points": strategy.global_limits.close_price_adjustment_points.iter()
                .map(|p| json!({"risk_value": p.risk_value, "multiplier": p.multiplier}))
                .collect::<Vec<_>>(),
        },
    })
}

fn condition_from_json(v: &Value) -> EngineResult<Condition> {
    let name = v
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let condition_type = v
        .get("condition_type")
        .or_else(|| v.get("indicatorId"))
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::validation("condition missing condition_type"))?
        .to_string();
    let operator_raw = v
        .get("operator")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::validation("condition missing operator"))?;
    let operator = Operator::parse(operator_raw).map_err(EngineError::validation)?;

    let value = match operator {
        Operator::Between => {
            let arr = v
                .get("value")
                .and_then(Value::as_array)
                .ok_or_else(|| EngineError::validation("between condition needs [min,max]"))?;
            let lo = arr[0].as_f64().unwrap_or(0.0);
            let hi = arr[1].as_f64().unwrap_or(0.0);
            ConditionValue::Range(lo, hi)
        }
        Operator::Allowed => {
            let arr = v
                .get("value")
                .and_then(Value::as_array)
                .ok_or_else(|| EngineError::validation("allowed condition needs a set"))?;
            ConditionValue::Set(arr.iter().filter_map(Value::as_f64).collect())
        }
        _ => ConditionValue::Scalar(v.get("value").and_then(Value::as_f64).unwrap_or(0.0)),
    };

    Ok(Condition {
        name,
        condition_type,
        operator,
        value,
        enabled: v.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        description: v
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn group_from_json(v: &Value) -> EngineResult<ConditionGroup> {
    let conditions = v
        .get("conditions")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().map(condition_from_json).collect::<EngineResult<Vec<_>>>())
        .transpose()?
        .unwrap_or_default();
    let require_all = v
        .get("require_all")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    Ok(ConditionGroup::new("", conditions, require_all))
}

fn group_from_doc(doc: &Value, modern_key: &str, legacy_key: &str) -> EngineResult<ConditionGroup> {
    if let Some(v) = doc.get(modern_key) {
        return group_from_json(v);
    }
    if let Some(v) = doc.get(legacy_key) {
        return group_from_json(v);
    }
    Ok(ConditionGroup::new("", vec![], true))
}

/// Accepts both legacy and modern section keys.
pub fn strategy_from_json(doc: &Value) -> EngineResult<Strategy> {
    let strategy_name = doc
        .get("strategy_name")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::validation("strategy missing strategy_name"))?
        .to_string();

    let direction = match doc.get("direction").and_then(Value::as_str).unwrap_or("LONG") {
        "LONG" => Direction::Long,
        "SHORT" => Direction::Short,
        "BOTH" => Direction::Both,
        other => return Err(EngineError::validation(format!("unknown direction: {other}"))),
    };

    let s1 = group_from_doc(doc, "s1_signal", "signal_detection")?;
    let o1 = group_from_doc(doc, "o1_cancel", "signal_cancellation")?;
    let z1 = group_from_doc(doc, "z1_entry", "entry_conditions")?;
    let ze1 = group_from_doc(doc, "ze1_close", "close_order_detection")?;
    // emergency_exit is spelled the same in both schemas.
    let e1 = group_from_doc(doc, "emergency_exit", "emergency_exit")?;

    let mut strategy = Strategy::new(strategy_name, direction, s1, o1, z1, ze1, e1);
    strategy.enabled = doc.get("enabled").and_then(Value::as_bool).unwrap_or(true);

    if let Some(ps) = doc.get("position_size") {
        let size_type = match ps.get("type").and_then(Value::as_str).unwrap_or("percentage") {
            "fixed" => PositionSizeType::Fixed,
            _ => PositionSizeType::Percentage,
        };
        strategy.position_size = PositionSizeSpec {
            size_type,
            value: ps.get("value").and_then(Value::as_f64).unwrap_or(0.02),
        };
    }

    if let Some(gl) = doc.get("global_limits") {
        let parse_points = |key: &str| -> Vec<InterpolationPoint> {
            gl.get(key)
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|p| {
                            Some(InterpolationPoint {
                                risk_value: p.get("risk_value")?.as_f64()?,
                                multiplier: p.get("multiplier")?.as_f64()?,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        strategy.global_limits = GlobalLimits {
            base_position_pct: gl.get("base_position_pct").and_then(Value::as_f64).unwrap_or(0.02),
            max_position_pct: gl.get("max_position_pct").and_then(Value::as_f64).unwrap_or(0.10),
            min_position_pct: gl.get("min_position_pct").and_then(Value::as_f64).unwrap_or(0.005),
            max_leverage: gl.get("max_leverage").and_then(Value::as_u64).unwrap_or(5) as u32,
            risk_adjustment_points: {
                let p = parse_points("risk_adjustment_points");
                if p.is_empty() { GlobalLimits::default().risk_adjustment_points } else { p }
            },
            close_price_adjustment_points: {
                let p = parse_points("close_price_adjustment_points");
                if p.is_empty() { GlobalLimits::default().close_price_adjustment_points } else { p }
            },
        };
    }

    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_strategy() -> Strategy {
        let s1 = ConditionGroup::new(
            "s1",
            vec![Condition::new("pump", "pump_magnitude_pct", ">=", ConditionValue::Scalar(5.0)).unwrap()],
            true,
        );
        let empty = ConditionGroup::new("empty", vec![], true);
        Strategy::new("pump_trader", Direction::Long, s1, empty.clone(), empty.clone(), empty.clone(), empty)
    }

    #[tokio::test]
    async fn round_trips_through_sqlite_store() {
        let store = SqliteStrategyStore::in_memory().unwrap();
        let strategy = sample_strategy();
        store.save(&strategy).await.unwrap();

        let loaded = store.load_enabled().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].strategy_name, "pump_trader");
        assert_eq!(loaded[0].s1_signal.conditions.len(), 1);
    }

    #[test]
    fn accepts_legacy_schema_keys() {
        let doc = json!({
            "strategy_name": "legacy_strat",
            "direction": "LONG",
            "enabled": true,
            "signal_detection": {
                "conditions": [{"name": "a", "condition_type": "pump_magnitude_pct", "operator": ">=", "value": 5.0}],
                "require_all": true
            },
            "signal_cancellation": {"conditions": [], "require_all": true},
            "entry_conditions": {"conditions": [], "require_all": true},
            "close_order_detection": {"conditions": [], "require_all": true},
            "emergency_exit": {"conditions": [], "require_all": true},
        });
        let strategy = strategy_from_json(&doc).unwrap();
        assert_eq!(strategy.s1_signal.conditions.len(), 1);
    }

    #[test]
    fn save_writes_modern_keys_only() {
        let strategy = sample_strategy();
        let doc = strategy_to_json(&strategy);
        assert!(doc.get("s1_signal").is_some());
        assert!(doc.get("signal_detection").is_none());
    }

    #[tokio::test]
    async fn soft_delete_excludes_from_load_enabled() {
        let store = SqliteStrategyStore::in_memory().unwrap();
        let strategy = sample_strategy();
        store.save(&strategy).await.unwrap();
        store.soft_delete("pump_trader").await.unwrap();
        let loaded = store.load_enabled().await.unwrap();
        assert!(loaded.is_empty());
    }
}
