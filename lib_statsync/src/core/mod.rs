//! # Core Engine Module
//!
//! This module forms the heart of the `statsync` engine: it keeps a set of
//! displayed demo metrics synchronized with a remote table that emits live
//! change notifications.
//!
//! ## Core Components:
//!
//! - **`store`**: Owns the nested `entityId -> metricName -> value` mapping and
//!   applies snapshot loads and single-event deltas atomically.
//!
//! - **`normalizer`**: Converts raw insert/update/delete notifications into a
//!   canonical `ChangeDelta`, degrading anything malformed to `Resync`.
//!
//! - **`lifecycle`**: Acquires and releases the remote change feed, sequences
//!   the initial snapshot against live events and guards against writes after
//!   teardown.
//!
//! - **`resolver`**: Answers presentation queries with either fully live or
//!   fully default values.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Trait seams for the remote snapshot query and change feed.
pub mod collaborator;
/// Error taxonomy shared by every component.
pub mod error;
/// Acquire/release of the change feed and the per-topic event pump.
pub mod lifecycle;
/// Rows, values, deltas and raw events.
pub mod model;
/// Raw change event to canonical delta translation.
pub mod normalizer;
/// Live-or-default reads for the presentation layer.
pub mod resolver;
/// The owned metric mapping.
pub mod store;

// --- Public API Re-exports ---
pub use collaborator::{ChangeFeed, SnapshotSource};
pub use error::{MisuseKind, SyncError};
pub use lifecycle::{FeedHandle, FeedState, LifecycleOptions, SubscriptionLifecycle};
pub use model::{ChangeDelta, DefaultMetrics, MetricMap, MetricRow, MetricValue, MetricValues, RawChangeEvent};
pub use normalizer::{normalize, Normalizer, ResyncPolicy};
pub use resolver::{MetricResolver, MetricSource, Resolved};
pub use store::{Epoch, MetricStore};
