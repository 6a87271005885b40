//! # Subscription Lifecycle
//!
//! Acquires and releases the remote change feed for a topic and pumps its
//! events, through the `Normalizer`, into the `MetricStore`.
//!
//! ## Per-topic state machine
//!
//! `Detached -> Attaching -> Attached -> Detached`. `Attaching` lasts until
//! the initial snapshot phase ends, successfully or not. A topic also falls
//! back to `Detached` on its own when the remote side closes the feed.
//!
//! ## Ordering
//!
//! Each attached topic gets exactly one pump task. It is the single consumer
//! of that topic's events, so deltas are applied in delivery order and never
//! interleave. While a snapshot fetch is in flight, incoming deltas are
//! buffered and applied after the snapshot lands: the final state is always
//! snapshot-then-deltas.
//!
//! ## Teardown
//!
//! `detach` cancels the pump and retires the attach epoch in the store. A
//! snapshot response or event still in flight afterwards is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::core::collaborator::{ChangeFeed, SnapshotSource};
use crate::core::error::SyncError;
use crate::core::model::{ChangeDelta, MetricRow, RawChangeEvent};
use crate::core::normalizer::{Normalizer, ResyncPolicy};
use crate::core::resolver::MetricResolver;
use crate::core::store::{Epoch, MetricStore};

/// Observable state of one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// No handle held.
    Detached,
    /// Feed open, initial snapshot phase still running.
    Attaching,
    /// Snapshot phase over; live events flow straight into the store.
    Attached,
}

/// Tuning knobs for the lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleOptions {
    /// Normalizer policy for every attached topic.
    pub policy: ResyncPolicy,
    /// Fetch a fresh snapshot after each `Resync`.
    pub refetch_on_resync: bool,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            policy: ResyncPolicy::Precise,
            refetch_on_resync: true,
        }
    }
}

/// # Feed Handle
///
/// Owning handle to one attached topic. Hand it back to
/// `SubscriptionLifecycle::detach` to release the feed.
#[must_use = "dropping a FeedHandle without detaching leaks the subscription"]
pub struct FeedHandle {
    topic: String,
    epoch: Epoch,
    token: CancellationToken,
    state_rx: watch::Receiver<FeedState>,
    warnings_rx: mpsc::Receiver<SyncError>,
}

impl FeedHandle {
    /// Warnings kept for a handle nobody reads; newer ones are dropped.
    pub const WARNING_CAPACITY: usize = 32;

    /// The topic this handle holds.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The store epoch tagging every write made for this handle.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Current state of the topic.
    pub fn state(&self) -> FeedState {
        *self.state_rx.borrow()
    }

    /// Waits until the initial snapshot phase is over and returns the state
    /// reached (`Attached`, or `Detached` if torn down first).
    pub async fn ready(&mut self) -> FeedState {
        match self.state_rx.wait_for(|s| *s != FeedState::Attaching).await {
            Ok(state) => *state,
            Err(_) => FeedState::Detached,
        }
    }

    /// Whether the topic was released, by `detach` or by the feed closing.
    pub fn is_closed(&self) -> bool {
        self.state() == FeedState::Detached
    }

    /// Waits until the topic is released, by `detach` or by the feed closing.
    pub async fn closed(&mut self) {
        let _ = self.state_rx.wait_for(|s| *s == FeedState::Detached).await;
    }

    /// Waits for the next recoverable warning (failed snapshot fetches).
    /// Returns `None` once the pump has stopped and every warning was read.
    pub async fn next_warning(&mut self) -> Option<SyncError> {
        self.warnings_rx.recv().await
    }

    /// Non-blocking variant of `next_warning`.
    pub fn try_warning(&mut self) -> Option<SyncError> {
        self.warnings_rx.try_recv().ok()
    }
}

struct Slot {
    epoch: Epoch,
    token: CancellationToken,
    state_tx: Arc<watch::Sender<FeedState>>,
}

type SlotTable = Arc<Mutex<HashMap<String, Slot>>>;

/// Removes the slot for `topic` if it still belongs to `epoch`, retires the
/// epoch and publishes `Detached`.
fn release_slot(slots: &SlotTable, store: &MetricStore, topic: &str, epoch: Epoch) -> bool {
    let slot = {
        let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get(topic) {
            Some(slot) if slot.epoch == epoch => slots.remove(topic),
            _ => None,
        }
    };
    match slot {
        Some(slot) => {
            slot.token.cancel();
            store.retire_epoch(epoch);
            slot.state_tx.send_replace(FeedState::Detached);
            true
        }
        None => false,
    }
}

/// Releases a reserved slot unless disarmed, so an attach abandoned halfway
/// (error or dropped future) never leaves the topic stuck.
struct PendingAttach<'a> {
    slots: &'a SlotTable,
    store: &'a MetricStore,
    topic: &'a str,
    epoch: Epoch,
    armed: bool,
}

impl PendingAttach<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingAttach<'_> {
    fn drop(&mut self) {
        if self.armed && release_slot(self.slots, self.store, self.topic, self.epoch) {
            log::debug!("Attach of '{}' (epoch {}) abandoned, slot released.", self.topic, self.epoch);
        }
    }
}

/// # Subscription Lifecycle
///
/// Holds at most one live handle per topic.
pub struct SubscriptionLifecycle<S, F> {
    store: Arc<MetricStore>,
    source: Arc<S>,
    feed: Arc<F>,
    options: LifecycleOptions,
    slots: SlotTable,
}

impl<S, F> SubscriptionLifecycle<S, F>
where
    S: SnapshotSource,
    F: ChangeFeed,
{
    /// Creates a lifecycle writing into `store`.
    pub fn new(store: Arc<MetricStore>, source: Arc<S>, feed: Arc<F>, options: LifecycleOptions) -> Self {
        Self {
            store,
            source,
            feed,
            options,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The store every attached topic writes into.
    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    /// A resolver reading this lifecycle's store.
    pub fn resolver(&self) -> MetricResolver {
        MetricResolver::new(Arc::clone(&self.store))
    }

    /// Opens the feed for `topic`, starts the initial snapshot load and begins
    /// forwarding events.
    ///
    /// A failing snapshot does not fail the attach; it surfaces as a warning
    /// on the returned handle while live events keep flowing.
    pub async fn attach(&self, topic: &str) -> Result<FeedHandle, SyncError> {
        let epoch;
        let token = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(FeedState::Attaching);
        let state_tx = Arc::new(state_tx);

        {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.contains_key(topic) {
                log::warn!("Attach refused: '{}' is already attached.", topic);
                return Err(SyncError::already_attached(topic));
            }
            epoch = self.store.begin_epoch();
            slots.insert(
                topic.to_string(),
                Slot {
                    epoch,
                    token: token.clone(),
                    state_tx: Arc::clone(&state_tx),
                },
            );
        }

        let pending = PendingAttach {
            slots: &self.slots,
            store: &self.store,
            topic,
            epoch,
            armed: true,
        };

        log::info!("Attaching '{}' (epoch {}).", topic, epoch);

        let events = match self.feed.open(topic, token.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                log::error!("Failed to open feed '{}': {}", topic, e);
                return Err(e);
            }
        };

        let (warnings_tx, warnings_rx) = mpsc::channel(FeedHandle::WARNING_CAPACITY);
        let pump = Pump {
            topic: topic.to_string(),
            epoch,
            token: token.clone(),
            store: Arc::clone(&self.store),
            slots: Arc::clone(&self.slots),
            source: Arc::clone(&self.source),
            normalizer: Normalizer::new(self.options.policy),
            refetch_on_resync: self.options.refetch_on_resync,
            state_tx,
            warnings_tx,
        };
        tokio::spawn(pump.run(events));
        pending.disarm();

        Ok(FeedHandle {
            topic: topic.to_string(),
            epoch,
            token,
            state_rx,
            warnings_rx,
        })
    }

    /// Releases the feed held by `handle`. Calling it again is a no-op.
    ///
    /// Once this returns, no event or snapshot for `handle` touches the store.
    pub fn detach(&self, handle: &FeedHandle) {
        handle.token.cancel();
        if release_slot(&self.slots, &self.store, &handle.topic, handle.epoch) {
            log::info!("Detached '{}' (epoch {}).", handle.topic, handle.epoch);
        } else {
            log::debug!("Detach of '{}' (epoch {}) ignored: already detached.", handle.topic, handle.epoch);
        }
    }

    /// Detaches every topic. Used at process shutdown.
    pub fn detach_all(&self) {
        let drained: Vec<(String, Slot)> = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.drain().collect()
        };
        for (topic, slot) in drained {
            slot.token.cancel();
            self.store.retire_epoch(slot.epoch);
            slot.state_tx.send_replace(FeedState::Detached);
            log::info!("Detached '{}' (epoch {}).", topic, slot.epoch);
        }
    }

    /// Current state of `topic`.
    pub fn state(&self, topic: &str) -> FeedState {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(topic)
            .map(|slot| *slot.state_tx.borrow())
            .unwrap_or(FeedState::Detached)
    }

    /// Topics currently held, sorted.
    pub fn attached_topics(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut topics: Vec<String> = slots.keys().cloned().collect();
        topics.sort();
        topics
    }
}

type FetchFuture = Pin<Box<dyn Future<Output = Result<Vec<MetricRow>, SyncError>> + Send>>;

/// The single consumer of one topic's events.
struct Pump<S> {
    topic: String,
    epoch: Epoch,
    token: CancellationToken,
    store: Arc<MetricStore>,
    slots: SlotTable,
    source: Arc<S>,
    normalizer: Normalizer,
    refetch_on_resync: bool,
    state_tx: Arc<watch::Sender<FeedState>>,
    warnings_tx: mpsc::Sender<SyncError>,
}

impl<S: SnapshotSource> Pump<S> {
    fn start_fetch(&self) -> FetchFuture {
        let source = Arc::clone(&self.source);
        Box::pin(async move { source.fetch().await })
    }

    async fn run(self, mut events: mpsc::Receiver<RawChangeEvent>) {
        let mut pending: Option<FetchFuture> = Some(self.start_fetch());
        let mut buffered: Vec<ChangeDelta> = Vec::new();
        let mut feed_open = true;

        loop {
            if !feed_open && pending.is_none() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    log::debug!("Pump for '{}' cancelled.", self.topic);
                    break;
                }

                result = poll_pending(&mut pending) => {
                    pending = None;
                    if !self.land_snapshot(result, &mut buffered) {
                        break;
                    }
                }

                event = events.recv(), if feed_open => {
                    let Some(raw) = event else {
                        log::warn!("Feed '{}' closed by remote side.", self.topic);
                        feed_open = false;
                        continue;
                    };
                    let delta = self.normalizer.normalize(&raw);

                    if pending.is_some() {
                        if delta == ChangeDelta::Resync {
                            // The snapshot in flight may predate whatever forced the resync.
                            buffered.clear();
                            if self.refetch_on_resync {
                                pending = Some(self.start_fetch());
                            } else {
                                buffered.push(ChangeDelta::Resync);
                            }
                        } else {
                            buffered.push(delta);
                        }
                        continue;
                    }

                    let resync = delta == ChangeDelta::Resync;
                    if !self.apply(delta) {
                        break;
                    }
                    if resync && self.refetch_on_resync {
                        log::info!("Resync on '{}': reloading snapshot.", self.topic);
                        pending = Some(self.start_fetch());
                    }
                }
            }
        }

        if !self.token.is_cancelled() && release_slot(&self.slots, &self.store, &self.topic, self.epoch) {
            log::warn!("Feed '{}' (epoch {}) ended; topic released.", self.topic, self.epoch);
        }
        log::debug!("Pump for '{}' (epoch {}) stopped.", self.topic, self.epoch);
    }

    /// Loads a finished snapshot, then replays what arrived meanwhile.
    /// Returns `false` once the epoch turned out to be retired.
    fn land_snapshot(&self, result: Result<Vec<MetricRow>, SyncError>, buffered: &mut Vec<ChangeDelta>) -> bool {
        match result {
            Ok(rows) => {
                let count = rows.len();
                if !self.store.load_snapshot_in(self.epoch, rows) {
                    log::debug!("{}", SyncError::DetachedEvent(self.topic.clone()));
                    return false;
                }
                log::info!("Snapshot for '{}' loaded: {} rows, {} buffered deltas.", self.topic, count, buffered.len());
            }
            Err(e) => {
                log::warn!("Snapshot for '{}' failed, serving defaults: {}", self.topic, e);
                if self.warnings_tx.try_send(e).is_err() {
                    log::debug!("Warning queue for '{}' full, warning dropped.", self.topic);
                }
            }
        }

        for delta in buffered.drain(..) {
            if !self.apply(delta) {
                return false;
            }
        }

        self.state_tx.send_if_modified(|state| {
            if *state == FeedState::Attaching {
                *state = FeedState::Attached;
                true
            } else {
                false
            }
        });
        true
    }

    fn apply(&self, delta: ChangeDelta) -> bool {
        if self.store.apply_delta_in(self.epoch, delta) {
            true
        } else {
            log::debug!("{}", SyncError::DetachedEvent(self.topic.clone()));
            false
        }
    }
}

async fn poll_pending(pending: &mut Option<FetchFuture>) -> Result<Vec<MetricRow>, SyncError> {
    match pending {
        Some(fetch) => fetch.await,
        None => std::future::pending().await,
    }
}
