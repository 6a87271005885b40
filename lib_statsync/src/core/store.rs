//! # Metric Store
//!
//! Owns the nested `entityId -> metricName -> value` mapping. Every mutation
//! goes through `load_snapshot` or `apply_delta` (or their epoch-guarded
//! variants used by the lifecycle) and happens under a single write lock, so
//! a reader never observes a half-applied delta.
//!
//! ## Epochs
//!
//! Each attach of a change feed allocates an `Epoch`. Writes issued on behalf
//! of a feed carry its epoch and are rejected, inside the same critical
//! section that would apply them, once that epoch has been retired. Retiring
//! happens on detach, which makes a late snapshot response or an in-flight
//! event harmless after teardown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core::model::{ChangeDelta, MetricMap, MetricRow, MetricValues};

/// Attach generation tag.
pub type Epoch = u64;

struct Inner {
    map: MetricMap,
    live_epochs: HashSet<Epoch>,
}

/// # Metric Store
///
/// Shared as `Arc<MetricStore>` between the lifecycle (the only writer in
/// normal operation) and any number of resolvers.
pub struct MetricStore {
    inner: RwLock<Inner>,
    next_epoch: AtomicU64,
    attached_once: AtomicBool,
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                map: MetricMap::new(),
                live_epochs: HashSet::new(),
            }),
            next_epoch: AtomicU64::new(1),
            attached_once: AtomicBool::new(false),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the whole mapping with one folded from `rows`.
    ///
    /// A repeated `(entityId, metricName)` keeps the value of the row folded
    /// last. Supplying each pair at most once is the caller's contract.
    pub fn load_snapshot<I>(&self, rows: I)
    where
        I: IntoIterator<Item = MetricRow>,
    {
        let fresh = fold_rows(rows);
        self.write().map = fresh;
    }

    /// Applies one canonical delta.
    pub fn apply_delta(&self, delta: ChangeDelta) {
        apply_to(&mut self.write().map, delta);
    }

    /// Allocates a new live epoch for an attach.
    pub fn begin_epoch(&self) -> Epoch {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        self.write().live_epochs.insert(epoch);
        self.attached_once.store(true, Ordering::Release);
        epoch
    }

    /// Retires `epoch`. Returns `false` if it was not live.
    pub fn retire_epoch(&self, epoch: Epoch) -> bool {
        self.write().live_epochs.remove(&epoch)
    }

    /// Whether writes tagged with `epoch` are still accepted.
    pub fn is_live(&self, epoch: Epoch) -> bool {
        self.read().live_epochs.contains(&epoch)
    }

    /// `load_snapshot` on behalf of a feed. Returns `false` and leaves the
    /// mapping untouched if `epoch` was retired.
    pub fn load_snapshot_in<I>(&self, epoch: Epoch, rows: I) -> bool
    where
        I: IntoIterator<Item = MetricRow>,
    {
        let fresh = fold_rows(rows);
        let mut inner = self.write();
        if !inner.live_epochs.contains(&epoch) {
            return false;
        }
        inner.map = fresh;
        true
    }

    /// `apply_delta` on behalf of a feed. Returns `false` and leaves the
    /// mapping untouched if `epoch` was retired.
    pub fn apply_delta_in(&self, epoch: Epoch, delta: ChangeDelta) -> bool {
        let mut inner = self.write();
        if !inner.live_epochs.contains(&epoch) {
            return false;
        }
        apply_to(&mut inner.map, delta);
        true
    }

    /// True once any feed has ever been attached to this store.
    pub fn has_attached(&self) -> bool {
        self.attached_once.load(Ordering::Acquire)
    }

    /// Live values for one entity, `None` if the entity was never observed.
    pub fn entity(&self, entity_id: &str) -> Option<MetricValues> {
        self.read().map.get(entity_id).cloned()
    }

    /// All entity keys currently present, sorted.
    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().map.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// A consistent copy of the whole mapping.
    pub fn snapshot(&self) -> MetricMap {
        self.read().map.clone()
    }

    /// Number of entity keys present.
    pub fn len(&self) -> usize {
        self.read().map.len()
    }

    /// True when no entity key is present.
    pub fn is_empty(&self) -> bool {
        self.read().map.is_empty()
    }
}

fn fold_rows<I>(rows: I) -> MetricMap
where
    I: IntoIterator<Item = MetricRow>,
{
    let mut map = MetricMap::new();
    for row in rows {
        map.entry(row.entity_id)
            .or_default()
            .insert(row.metric_name, row.metric_value);
    }
    map
}

fn apply_to(map: &mut MetricMap, delta: ChangeDelta) {
    match delta {
        ChangeDelta::Upsert {
            entity_id,
            metric_name,
            metric_value,
        } => {
            map.entry(entity_id).or_default().insert(metric_name, metric_value);
        }
        ChangeDelta::Delete {
            entity_id,
            metric_name,
        } => {
            // The entity key survives even when its last metric goes.
            if let Some(metrics) = map.get_mut(&entity_id) {
                metrics.remove(&metric_name);
            }
        }
        ChangeDelta::Resync => map.clear(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::MetricValue;

    #[test]
    fn test_snapshot_folds_rows_last_write_wins() {
        let store = MetricStore::new();
        store.load_snapshot(vec![
            MetricRow::new("analytics", "queries", "1.0M/day"),
            MetricRow::new("analytics", "latency", "<50ms"),
            MetricRow::new("analytics", "queries", "1.2M/day"),
            MetricRow::new("reporting", "reports", 500),
        ]);

        let analytics = store.entity("analytics").unwrap();
        assert_eq!(analytics.len(), 2);
        assert_eq!(analytics["queries"], MetricValue::from("1.2M/day"));
        assert_eq!(store.entity_ids(), vec!["analytics", "reporting"]);
    }

    #[test]
    fn test_snapshot_replaces_previous_state_entirely() {
        let store = MetricStore::new();
        store.apply_delta(ChangeDelta::upsert("segmentation", "segments", "10"));
        store.apply_delta(ChangeDelta::upsert("analytics", "uptime", "90%"));

        store.load_snapshot(vec![MetricRow::new("analytics", "queries", "1.2M/day")]);

        assert!(store.entity("segmentation").is_none());
        let analytics = store.entity("analytics").unwrap();
        assert_eq!(analytics.len(), 1);
        assert!(!analytics.contains_key("uptime"));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let once = MetricStore::new();
        once.apply_delta(ChangeDelta::upsert("analytics", "latency", "50ms"));

        let twice = MetricStore::new();
        twice.apply_delta(ChangeDelta::upsert("analytics", "latency", "50ms"));
        twice.apply_delta(ChangeDelta::upsert("analytics", "latency", "50ms"));

        assert_eq!(once.snapshot(), twice.snapshot());
    }

    #[test]
    fn test_later_upsert_wins() {
        let store = MetricStore::new();
        store.apply_delta(ChangeDelta::upsert("analytics", "latency", "50ms"));
        store.apply_delta(ChangeDelta::upsert("analytics", "latency", "40ms"));
        assert_eq!(store.entity("analytics").unwrap()["latency"], MetricValue::from("40ms"));
    }

    #[test]
    fn test_delete_keeps_empty_entity_and_ignores_missing_keys() {
        let store = MetricStore::new();
        store.apply_delta(ChangeDelta::upsert("analytics", "latency", "50ms"));
        store.apply_delta(ChangeDelta::delete("analytics", "latency"));
        store.apply_delta(ChangeDelta::delete("analytics", "latency"));
        store.apply_delta(ChangeDelta::delete("never-seen", "latency"));

        assert_eq!(store.entity("analytics"), Some(MetricValues::new()));
        assert!(store.entity("never-seen").is_none());
    }

    #[test]
    fn test_resync_clears_everything() {
        let store = MetricStore::new();
        store.load_snapshot(vec![MetricRow::new("analytics", "queries", "1.2M/day")]);
        store.apply_delta(ChangeDelta::Resync);
        assert!(store.is_empty());
    }

    #[test]
    fn test_retired_epoch_writes_are_rejected() {
        let store = MetricStore::new();
        assert!(!store.has_attached());

        let epoch = store.begin_epoch();
        assert!(store.has_attached());
        assert!(store.apply_delta_in(epoch, ChangeDelta::upsert("analytics", "uptime", "99.9%")));

        assert!(store.retire_epoch(epoch));
        assert!(!store.retire_epoch(epoch));
        assert!(!store.apply_delta_in(epoch, ChangeDelta::upsert("analytics", "uptime", "0%")));
        assert!(!store.load_snapshot_in(epoch, Vec::new()));

        assert_eq!(store.entity("analytics").unwrap()["uptime"], MetricValue::from("99.9%"));
    }

    #[test]
    fn test_epochs_are_independent() {
        let store = MetricStore::new();
        let first = store.begin_epoch();
        let second = store.begin_epoch();
        assert_ne!(first, second);

        store.retire_epoch(first);
        assert!(store.is_live(second));
        assert!(store.apply_delta_in(second, ChangeDelta::upsert("reporting", "saved", "200h")));
    }
}
