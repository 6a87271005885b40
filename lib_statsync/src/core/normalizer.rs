//! # Change Event Normalizer
//!
//! Turns heterogeneous change-feed records into a canonical `ChangeDelta`.
//! Anything that cannot be mapped precisely becomes `Resync`, forcing a full
//! reload instead of applying a partial update.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::SyncError;
use crate::core::model::{
    ChangeDelta, MetricValue, RawChangeEvent, FIELD_ENTITY_ID, FIELD_METRIC_NAME,
    FIELD_METRIC_VALUE,
};

/// How recognized events are translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResyncPolicy {
    /// Insert/update become `Upsert`, delete becomes `Delete`.
    #[default]
    Precise,
    /// Every event becomes `Resync` (refetch the snapshot on any change).
    AlwaysResync,
}

impl std::str::FromStr for ResyncPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "precise" => Ok(ResyncPolicy::Precise),
            "always" | "alwaysresync" | "always-resync" => Ok(ResyncPolicy::AlwaysResync),
            other => Err(SyncError::Config(format!("unknown resync policy '{}'", other))),
        }
    }
}

/// Stateless translator; `Copy` so each pump can own one.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    policy: ResyncPolicy,
}

impl Normalizer {
    /// Creates a normalizer applying `policy`.
    pub fn new(policy: ResyncPolicy) -> Self {
        Self { policy }
    }

    /// The policy in effect.
    pub fn policy(&self) -> ResyncPolicy {
        self.policy
    }

    /// Strict translation. Malformed or unrecognized input is an error.
    pub fn try_normalize(&self, raw: &RawChangeEvent) -> Result<ChangeDelta, SyncError> {
        let delta = match raw.event_type.to_ascii_lowercase().as_str() {
            "insert" | "update" => {
                let image = raw
                    .new
                    .as_ref()
                    .ok_or_else(|| malformed(raw, "missing new image"))?;
                ChangeDelta::Upsert {
                    entity_id: text_field(image, FIELD_ENTITY_ID).ok_or_else(|| malformed(raw, FIELD_ENTITY_ID))?,
                    metric_name: text_field(image, FIELD_METRIC_NAME).ok_or_else(|| malformed(raw, FIELD_METRIC_NAME))?,
                    metric_value: image
                        .get(FIELD_METRIC_VALUE)
                        .and_then(MetricValue::from_json)
                        .ok_or_else(|| malformed(raw, FIELD_METRIC_VALUE))?,
                }
            }
            "delete" => {
                let image = raw
                    .old
                    .as_ref()
                    .ok_or_else(|| malformed(raw, "missing old image"))?;
                ChangeDelta::Delete {
                    entity_id: text_field(image, FIELD_ENTITY_ID).ok_or_else(|| malformed(raw, FIELD_ENTITY_ID))?,
                    metric_name: text_field(image, FIELD_METRIC_NAME).ok_or_else(|| malformed(raw, FIELD_METRIC_NAME))?,
                }
            }
            _ => return Err(malformed(raw, "unrecognized event type")),
        };

        Ok(match self.policy {
            ResyncPolicy::Precise => delta,
            ResyncPolicy::AlwaysResync => ChangeDelta::Resync,
        })
    }

    /// Lenient translation: never fails, degrades bad input to `Resync`.
    pub fn normalize(&self, raw: &RawChangeEvent) -> ChangeDelta {
        match self.try_normalize(raw) {
            Ok(delta) => delta,
            Err(e) => {
                log::warn!("{}. Degrading to resync.", e);
                ChangeDelta::Resync
            }
        }
    }
}

/// `Normalizer::default().normalize(raw)`.
pub fn normalize(raw: &RawChangeEvent) -> ChangeDelta {
    Normalizer::default().normalize(raw)
}

fn text_field(image: &Map<String, Value>, key: &str) -> Option<String> {
    match image.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn malformed(raw: &RawChangeEvent, what: &str) -> SyncError {
    SyncError::MalformedEvent(format!("'{}' event: {}", raw.event_type, what))
}
