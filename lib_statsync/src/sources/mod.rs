//! # Remote Collaborators
//!
//! Concrete implementations of `SnapshotSource` and `ChangeFeed`.
//!
//! ## Contained Modules:
//! - **`memory`**: In-process source and feed for tests and dry runs.
//! - **`postgrest`**: Snapshot query against a PostgREST endpoint (feature `sources`).
//! - **`realtime_wss`**: Phoenix-channel websocket change feed (feature `sources`).

#![forbid(unsafe_code)]

/// In-process snapshot source and change feed.
pub mod memory;
/// Snapshot query over HTTP with retries.
#[cfg(feature = "sources")]
pub mod postgrest;
/// Websocket change feed speaking the realtime channel protocol.
#[cfg(feature = "sources")]
pub mod realtime_wss;

pub use memory::{MemoryFeed, MemorySnapshot, SnapshotGate};
#[cfg(feature = "sources")]
pub use postgrest::{ColumnMap, PostgrestSnapshot};
#[cfg(feature = "sources")]
pub use realtime_wss::{RealtimeConfig, RealtimeFeed};
