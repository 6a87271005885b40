//! # In-Memory Collaborators
//!
//! A snapshot source and a change feed that live entirely in the process.
//! Used by tests and by the live runner's dry mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::collaborator::{ChangeFeed, SnapshotSource};
use crate::core::error::SyncError;
use crate::core::model::{MetricRow, RawChangeEvent};

/// Lets a gated `MemorySnapshot` answer one pending fetch.
#[derive(Clone)]
pub struct SnapshotGate(Arc<Semaphore>);

impl SnapshotGate {
    /// Releases exactly one fetch.
    pub fn release(&self) {
        self.0.add_permits(1);
    }
}

/// # Memory Snapshot
///
/// Returns a fixed set of rows, optionally failing or waiting on a gate.
pub struct MemorySnapshot {
    rows: Mutex<Vec<MetricRow>>,
    failure: Mutex<Option<String>>,
    gate: Option<Arc<Semaphore>>,
    fetches: AtomicUsize,
}

impl MemorySnapshot {
    /// Answers every fetch immediately with `rows`.
    pub fn new(rows: Vec<MetricRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            failure: Mutex::new(None),
            gate: None,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Fails every fetch with `TransientFetch(message)`.
    pub fn failing(message: &str) -> Self {
        let source = Self::new(Vec::new());
        source.set_failure(Some(message));
        source
    }

    /// Holds each fetch until the returned gate is released.
    pub fn gated(rows: Vec<MetricRow>) -> (Self, SnapshotGate) {
        let semaphore = Arc::new(Semaphore::new(0));
        let source = Self {
            gate: Some(Arc::clone(&semaphore)),
            ..Self::new(rows)
        };
        (source, SnapshotGate(semaphore))
    }

    /// Replaces the rows served by later fetches.
    pub fn set_rows(&self, rows: Vec<MetricRow>) {
        *self.rows.lock().unwrap_or_else(PoisonError::into_inner) = rows;
    }

    /// Makes later fetches fail (`Some`) or succeed (`None`).
    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = message.map(str::to_string);
    }

    /// Number of fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl SnapshotSource for MemorySnapshot {
    async fn fetch(&self) -> Result<Vec<MetricRow>, SyncError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| SyncError::TransientFetch(e.to_string()))?
                .forget();
        }

        if let Some(message) = self.failure.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(SyncError::TransientFetch(message));
        }
        Ok(self.rows.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

type SenderTable = Arc<Mutex<HashMap<String, (u64, mpsc::Sender<RawChangeEvent>)>>>;

/// # Memory Feed
///
/// Each `open` creates a bounded channel; tests push events with `publish`.
/// A topic's sender is dropped as soon as its cancellation token fires.
pub struct MemoryFeed {
    capacity: usize,
    senders: SenderTable,
    opens: AtomicUsize,
    next_id: AtomicU64,
    fail_next: Mutex<Option<String>>,
}

impl MemoryFeed {
    /// Creates a feed whose channels hold up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            senders: Arc::new(Mutex::new(HashMap::new())),
            opens: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            fail_next: Mutex::new(None),
        }
    }

    /// Makes the next `open` fail with `SyncError::Feed(message)`.
    pub fn fail_next_open(&self, message: &str) {
        *self.fail_next.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.to_string());
    }

    /// Delivers `event` on `topic`. Returns `false` if the topic is not open.
    pub async fn publish(&self, topic: &str, event: RawChangeEvent) -> bool {
        match self.sender(topic) {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// A raw sender for `topic`, bypassing the open/closed bookkeeping.
    pub fn sender(&self, topic: &str) -> Option<mpsc::Sender<RawChangeEvent>> {
        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.get(topic).map(|(_, tx)| tx.clone())
    }

    /// Whether `topic` currently has an open channel.
    pub fn is_open(&self, topic: &str) -> bool {
        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.get(topic).is_some_and(|(_, tx)| !tx.is_closed())
    }

    /// Drops the sender for `topic`, as a remote hang-up would.
    pub fn close(&self, topic: &str) -> bool {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.remove(topic).is_some()
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl ChangeFeed for MemoryFeed {
    async fn open(&self, topic: &str, token: CancellationToken) -> Result<mpsc::Receiver<RawChangeEvent>, SyncError> {
        if let Some(message) = self.fail_next.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Err(SyncError::Feed(message));
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string(), (id, tx));
        self.opens.fetch_add(1, Ordering::SeqCst);

        let senders = Arc::clone(&self.senders);
        let topic = topic.to_string();
        tokio::spawn(async move {
            token.cancelled().await;
            let mut senders = senders.lock().unwrap_or_else(PoisonError::into_inner);
            if senders.get(&topic).is_some_and(|(owner, _)| *owner == id) {
                senders.remove(&topic);
                log::debug!("Memory feed '{}' released.", topic);
            }
        });

        Ok(rx)
    }
}
