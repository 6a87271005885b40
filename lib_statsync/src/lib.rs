//! Keeps displayed demo metrics in sync with a remote table that emits live
//! change notifications.

/// The synchronization engine.
#[cfg(feature = "core")]
pub mod core;
/// Snapshot sources and change feeds.
#[cfg(feature = "core")]
pub mod sources;
/// Startup configuration: the per-entity defaults catalog.
#[cfg(feature = "configs")]
pub mod configs;
/// HTTP client with retry middleware.
#[cfg(feature = "sources")]
pub mod retrieve;

#[cfg(feature = "core")]
pub use crate::core::*;
