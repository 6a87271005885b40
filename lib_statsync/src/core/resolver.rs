//! # Metric Resolver
//!
//! The read side used by the presentation layer. A result is either entirely
//! live or entirely default, never a field-by-field mix of the two.

use serde::Serialize;
use std::sync::Arc;

use crate::core::error::SyncError;
use crate::core::model::{DefaultMetrics, MetricValues};
use crate::core::store::MetricStore;

/// Where a resolved mapping came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricSource {
    /// Values observed from the remote source.
    Live,
    /// The caller's static defaults.
    Default,
}

/// A resolved mapping tagged with its origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved {
    /// Origin of `metrics`.
    pub source: MetricSource,
    /// The mapping to display.
    pub metrics: MetricValues,
}

/// Cheap to clone; every clone reads the same store.
#[derive(Clone)]
pub struct MetricResolver {
    store: Arc<MetricStore>,
}

impl MetricResolver {
    /// Creates a resolver over `store`.
    pub fn new(store: Arc<MetricStore>) -> Self {
        Self { store }
    }

    /// Live values for `entity_id` when present and non-empty, else `defaults`.
    pub fn resolve(&self, entity_id: &str, defaults: &DefaultMetrics) -> MetricValues {
        self.resolve_tagged(entity_id, defaults).metrics
    }

    /// Like `resolve`, also reporting which side the values came from.
    pub fn resolve_tagged(&self, entity_id: &str, defaults: &DefaultMetrics) -> Resolved {
        match self.store.entity(entity_id) {
            Some(live) if !live.is_empty() => Resolved {
                source: MetricSource::Live,
                metrics: live,
            },
            _ => Resolved {
                source: MetricSource::Default,
                metrics: defaults.clone(),
            },
        }
    }

    /// Like `resolve`, but reports a read before any feed was attached.
    pub fn try_resolve(&self, entity_id: &str, defaults: &DefaultMetrics) -> Result<MetricValues, SyncError> {
        if !self.store.has_attached() {
            log::debug!("Resolve of '{}' before any attach.", entity_id);
            return Err(SyncError::not_attached(""));
        }
        Ok(self.resolve(entity_id, defaults))
    }
}
