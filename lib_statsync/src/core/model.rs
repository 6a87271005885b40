//! # Data Model
//!
//! Plain data types shared by every part of the synchronization engine: the
//! remote row shape, the nested in-memory mapping, the canonical delta and
//! the raw change-feed record it is derived from.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Field carrying the entity key on a row image.
pub const FIELD_ENTITY_ID: &str = "entityId";
/// Field carrying the metric name on a row image.
pub const FIELD_METRIC_NAME: &str = "metricName";
/// Field carrying the display value on a row image.
pub const FIELD_METRIC_VALUE: &str = "metricValue";

/// # Metric Value
///
/// A display-ready metric value. The remote table stores either text
/// (`"1.2M/day"`) or a plain number; both are rendered verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// A preformatted string such as `"<50ms"`.
    Text(String),
    /// A raw JSON number.
    Number(serde_json::Number),
}

impl MetricValue {
    /// Converts a JSON value into a metric value.
    ///
    /// Only strings and numbers qualify; `null`, booleans, arrays and objects
    /// yield `None`.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(MetricValue::Text(s.clone())),
            Value::Number(n) => Some(MetricValue::Number(n.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Text(s) => f.write_str(s),
            MetricValue::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for MetricValue {
    fn from(s: &str) -> Self {
        MetricValue::Text(s.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(s: String) -> Self {
        MetricValue::Text(s)
    }
}

impl From<i64> for MetricValue {
    fn from(n: i64) -> Self {
        MetricValue::Number(n.into())
    }
}

impl From<i32> for MetricValue {
    fn from(n: i32) -> Self {
        MetricValue::Number(n.into())
    }
}

/// `metricName -> value` for a single entity.
pub type MetricValues = BTreeMap<String, MetricValue>;

/// Static per-entity fallback values supplied by the caller.
pub type DefaultMetrics = MetricValues;

/// `entityId -> metricName -> value`.
///
/// An absent `entityId` means no live data was observed for it yet, which is
/// not the same as an entity whose metrics were all deleted.
pub type MetricMap = HashMap<String, MetricValues>;

/// # Metric Row
///
/// A single fact as returned by the remote snapshot query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRow {
    /// The demo/dataset the metric belongs to.
    pub entity_id: String,
    /// Unique within an entity.
    pub metric_name: String,
    /// Display-ready value.
    pub metric_value: MetricValue,
}

impl MetricRow {
    /// Convenience constructor, mostly for tests and in-memory sources.
    pub fn new(entity_id: &str, metric_name: &str, metric_value: impl Into<MetricValue>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            metric_name: metric_name.to_string(),
            metric_value: metric_value.into(),
        }
    }
}

/// # Change Delta
///
/// The canonical, normalized form of one change-feed event. This is the only
/// input `MetricStore::apply_delta` accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeDelta {
    /// Set `entity_id / metric_name` to `metric_value`.
    Upsert {
        /// Target entity.
        entity_id: String,
        /// Target metric.
        metric_name: String,
        /// New value.
        metric_value: MetricValue,
    },
    /// Remove `metric_name` from `entity_id`; the entity key itself stays.
    Delete {
        /// Target entity.
        entity_id: String,
        /// Metric to remove.
        metric_name: String,
    },
    /// Discard the whole mapping; a fresh snapshot must follow.
    Resync,
}

impl ChangeDelta {
    /// Builds an `Upsert`.
    pub fn upsert(entity_id: &str, metric_name: &str, metric_value: impl Into<MetricValue>) -> Self {
        ChangeDelta::Upsert {
            entity_id: entity_id.to_string(),
            metric_name: metric_name.to_string(),
            metric_value: metric_value.into(),
        }
    }

    /// Builds a `Delete`.
    pub fn delete(entity_id: &str, metric_name: &str) -> Self {
        ChangeDelta::Delete {
            entity_id: entity_id.to_string(),
            metric_name: metric_name.to_string(),
        }
    }
}

/// # Raw Change Event
///
/// A row-level notification exactly as the remote change feed emits it: an
/// event-type tag plus the row image after (`new`) and/or before (`old`) the
/// change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChangeEvent {
    /// `insert`, `update`, `delete`, or anything else the feed invents.
    pub event_type: String,
    /// Row image after the change; absent on deletes.
    #[serde(default)]
    pub new: Option<Map<String, Value>>,
    /// Row image before the change.
    #[serde(default)]
    pub old: Option<Map<String, Value>>,
}

impl RawChangeEvent {
    /// An insert carrying a canonical `new` image.
    pub fn insert(entity_id: &str, metric_name: &str, metric_value: impl Into<Value>) -> Self {
        Self {
            event_type: "insert".to_string(),
            new: Some(row_image(entity_id, metric_name, metric_value.into())),
            old: None,
        }
    }

    /// An update carrying a canonical `new` image.
    pub fn update(entity_id: &str, metric_name: &str, metric_value: impl Into<Value>) -> Self {
        Self {
            event_type: "update".to_string(),
            ..Self::insert(entity_id, metric_name, metric_value)
        }
    }

    /// A delete carrying only the `old` key fields.
    pub fn delete(entity_id: &str, metric_name: &str) -> Self {
        let mut old = Map::new();
        old.insert(FIELD_ENTITY_ID.to_string(), Value::String(entity_id.to_string()));
        old.insert(FIELD_METRIC_NAME.to_string(), Value::String(metric_name.to_string()));
        Self {
            event_type: "delete".to_string(),
            new: None,
            old: Some(old),
        }
    }
}

fn row_image(entity_id: &str, metric_name: &str, metric_value: Value) -> Map<String, Value> {
    let mut image = Map::new();
    image.insert(FIELD_ENTITY_ID.to_string(), Value::String(entity_id.to_string()));
    image.insert(FIELD_METRIC_NAME.to_string(), Value::String(metric_name.to_string()));
    image.insert(FIELD_METRIC_VALUE.to_string(), metric_value);
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metric_row_reads_camel_case_and_numbers() {
        let row: MetricRow = serde_json::from_value(json!({
            "entityId": "segmentation",
            "metricName": "segments",
            "metricValue": 12
        }))
        .unwrap();
        assert_eq!(row, MetricRow::new("segmentation", "segments", 12));
        assert_eq!(row.metric_value.to_string(), "12");
    }

    #[test]
    fn test_metric_value_rejects_non_scalar_json() {
        assert!(MetricValue::from_json(&json!(null)).is_none());
        assert!(MetricValue::from_json(&json!(true)).is_none());
        assert!(MetricValue::from_json(&json!({"a": 1})).is_none());
        assert_eq!(MetricValue::from_json(&json!("99.9%")), Some(MetricValue::from("99.9%")));
    }
}
