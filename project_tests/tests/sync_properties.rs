//! Store, normalizer and resolver properties exercised through the public API.

use std::sync::Arc;

use lib_statsync::configs::defaults_catalog::DefaultsCatalog;
use lib_statsync::{
    normalize, ChangeDelta, DefaultMetrics, MetricResolver, MetricRow, MetricStore, MetricValue,
    RawChangeEvent,
};
use serde_json::{json, Map, Value};

const ENTITIES: [&str; 3] = ["analytics", "segmentation", "reporting"];
const METRICS: [&str; 4] = ["queries", "latency", "uptime", "segments"];

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as usize
    }
}

fn defaults(entity: &str) -> DefaultMetrics {
    DefaultsCatalog::builtin().get(entity).cloned().unwrap_or_default()
}

#[test]
fn untouched_entities_always_resolve_to_defaults() {
    for seed in 0..200u64 {
        let mut rng = Lcg(seed);
        let store = Arc::new(MetricStore::new());
        let resolver = MetricResolver::new(Arc::clone(&store));

        // Upserts only ever target the first two entities.
        let count = rng.next() % 20;
        for i in 0..count {
            let entity = ENTITIES[rng.next() % 2];
            let metric = METRICS[rng.next() % METRICS.len()];
            store.apply_delta(ChangeDelta::upsert(entity, metric, format!("v{}", i).as_str()));
        }

        assert_eq!(resolver.resolve("reporting", &defaults("reporting")), defaults("reporting"), "seed {}", seed);
    }
}

#[test]
fn repeated_upsert_is_idempotent() {
    let mut rng = Lcg(7);
    for _ in 0..100 {
        let entity = ENTITIES[rng.next() % ENTITIES.len()];
        let metric = METRICS[rng.next() % METRICS.len()];
        let delta = ChangeDelta::upsert(entity, metric, "42");

        let once = MetricStore::new();
        once.load_snapshot(vec![MetricRow::new("analytics", "uptime", "99.9%")]);
        once.apply_delta(delta.clone());

        let twice = MetricStore::new();
        twice.load_snapshot(vec![MetricRow::new("analytics", "uptime", "99.9%")]);
        twice.apply_delta(delta.clone());
        twice.apply_delta(delta);

        assert_eq!(once.snapshot(), twice.snapshot());
    }
}

#[test]
fn delete_of_last_metric_falls_back_to_full_defaults() {
    let store = Arc::new(MetricStore::new());
    let resolver = MetricResolver::new(Arc::clone(&store));

    store.apply_delta(ChangeDelta::upsert("analytics", "queries", "2M/day"));
    store.apply_delta(ChangeDelta::delete("analytics", "queries"));

    let resolved = resolver.resolve("analytics", &defaults("analytics"));
    assert_eq!(resolved, defaults("analytics"));
    assert_eq!(resolved.len(), 3);
}

#[test]
fn snapshot_supersedes_prior_deltas() {
    let store = Arc::new(MetricStore::new());
    let resolver = MetricResolver::new(Arc::clone(&store));

    store.apply_delta(ChangeDelta::upsert("analytics", "latency", "80ms"));
    store.apply_delta(ChangeDelta::upsert("analytics", "stale", "x"));
    store.apply_delta(ChangeDelta::upsert("reporting", "reports", "1/mo"));

    store.load_snapshot(vec![
        MetricRow::new("analytics", "queries", "1.2M/day"),
        MetricRow::new("analytics", "latency", "<50ms"),
    ]);

    let analytics = resolver.resolve("analytics", &defaults("analytics"));
    assert_eq!(
        analytics,
        DefaultMetrics::from([
            ("queries".to_string(), MetricValue::from("1.2M/day")),
            ("latency".to_string(), MetricValue::from("<50ms")),
        ])
    );
    assert_eq!(resolver.resolve("reporting", &defaults("reporting")), defaults("reporting"));
}

#[test]
fn later_event_wins_for_the_same_metric() {
    let store = Arc::new(MetricStore::new());
    let resolver = MetricResolver::new(Arc::clone(&store));

    for raw in [
        RawChangeEvent::insert("analytics", "latency", "50ms"),
        RawChangeEvent::update("analytics", "latency", "40ms"),
    ] {
        store.apply_delta(normalize(&raw));
    }

    assert_eq!(resolver.resolve("analytics", &defaults("analytics"))["latency"], MetricValue::from("40ms"));
}

#[test]
fn event_missing_metric_name_becomes_resync() {
    let mut image = Map::new();
    image.insert("entityId".to_string(), json!("analytics"));
    image.insert("metricValue".to_string(), json!("2M/day"));

    for event_type in ["insert", "update", "INSERT"] {
        let raw = RawChangeEvent {
            event_type: event_type.to_string(),
            new: Some(image.clone()),
            old: None,
        };
        assert_eq!(normalize(&raw), ChangeDelta::Resync);
    }
}

#[test]
fn raw_events_decode_from_feed_json() {
    let raw: RawChangeEvent = serde_json::from_value(json!({
        "eventType": "update",
        "new": {"entityId": "segmentation", "metricName": "accuracy", "metricValue": 95},
    }))
    .unwrap();

    assert_eq!(
        normalize(&raw),
        ChangeDelta::Upsert {
            entity_id: "segmentation".to_string(),
            metric_name: "accuracy".to_string(),
            metric_value: MetricValue::from_json(&Value::from(95)).unwrap(),
        }
    );
}

#[test]
fn analytics_snapshot_example() {
    let store = Arc::new(MetricStore::new());
    let resolver = MetricResolver::new(Arc::clone(&store));
    store.load_snapshot(vec![MetricRow::new("analytics", "queries", "1.2M/day")]);

    assert_eq!(
        resolver.resolve("analytics", &defaults("analytics")),
        DefaultMetrics::from([("queries".to_string(), MetricValue::from("1.2M/day"))])
    );
    assert_eq!(resolver.resolve("segmentation", &defaults("segmentation")), defaults("segmentation"));
}

#[test]
fn concurrent_readers_never_observe_a_partial_snapshot() {
    let store = Arc::new(MetricStore::new());
    let resolver = MetricResolver::new(Arc::clone(&store));
    let fallback = DefaultMetrics::from([("queries".to_string(), MetricValue::from("fallback"))]);
    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let writer = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            for i in 0..2000i64 {
                store.load_snapshot(vec![
                    MetricRow::new("analytics", "queries", i),
                    MetricRow::new("analytics", "latency", i),
                    MetricRow::new("analytics", "uptime", i),
                    MetricRow::new("reporting", "reports", i),
                ]);
                if i % 7 == 0 {
                    store.apply_delta(ChangeDelta::Resync);
                }
            }
            done.store(true, std::sync::atomic::Ordering::SeqCst);
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            let resolver = resolver.clone();
            let fallback = fallback.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    let resolved = resolver.resolve("analytics", &fallback);
                    if resolved != fallback {
                        assert_eq!(resolved.len(), 3, "partial entity: {:?}", resolved);
                        let first = &resolved["queries"];
                        assert!(resolved.values().all(|v| v == first), "mixed values: {:?}", resolved);
                    }

                    let map = store.snapshot();
                    if !map.is_empty() {
                        assert_eq!(map.len(), 2, "partial map: {:?}", map);
                        let first = &map["analytics"]["queries"];
                        assert!(map.values().flat_map(|m| m.values()).all(|v| v == first), "mixed map: {:?}", map);
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}
