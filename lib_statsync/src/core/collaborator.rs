//! # Collaborator Seams
//!
//! The lifecycle talks to the remote side only through these two traits.
//! Concrete adapters live in `crate::sources`.

use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::error::SyncError;
use crate::core::model::{MetricRow, RawChangeEvent};

/// A query returning every current metric row.
pub trait SnapshotSource: Send + Sync + 'static {
    /// Fetches the full snapshot. Failures should map to `SyncError::TransientFetch`.
    fn fetch(&self) -> impl Future<Output = Result<Vec<MetricRow>, SyncError>> + Send;
}

/// A subscription to row-level change notifications.
pub trait ChangeFeed: Send + Sync + 'static {
    /// Opens the feed for `topic`.
    ///
    /// The returned receiver yields events in delivery order. The feed must
    /// release its underlying resource once `token` is cancelled or the
    /// receiver is dropped, whichever comes first.
    fn open(
        &self,
        topic: &str,
        token: CancellationToken,
    ) -> impl Future<Output = Result<mpsc::Receiver<RawChangeEvent>, SyncError>> + Send;
}
