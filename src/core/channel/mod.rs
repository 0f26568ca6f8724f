//! Per-tag-set channel actor.
//!
//! A [`Channel`] owns the pending id list and the item store of one
//! `(queue, tags)` pair and runs a single dispatch loop that offers one
//! candidate at a time through its handoff source (see [`dispatch`]).
//!
//! Lock order: channel state, then an item's own lock. Neither is held
//! across an await.

pub mod dispatch;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::admission::{AdmissionService, CounterKind};
use crate::core::error::BrokerError;
use crate::core::item::{Item, ItemId, RetryPosition};
use crate::core::merge::SourceId;
use crate::core::message::{Ack, EnqueueItem};
use crate::core::tags::KeyValues;
use crate::metrics;

pub use dispatch::{Delivery, Dispatch};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Timing knobs for the dispatch loop.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    /// Sleep between saturation checks while admission is blocked.
    pub admission_poll_interval: Duration,
    /// Upper bound for the backoff applied while the admission service is unreachable.
    pub admission_max_backoff: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            admission_poll_interval: Duration::from_secs(5),
            admission_max_backoff: Duration::from_secs(60),
        }
    }
}

/// Events a channel emits toward its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel may have become empty; the owner should try to delete it.
    TryDelete {
        queue: String,
        tags: KeyValues,
        source: SourceId,
    },
}

#[derive(Debug, Default)]
struct ChannelState {
    pending: VecDeque<ItemId>,
    items: HashMap<ItemId, Arc<Item>>,
    closed: bool,
}

pub(crate) struct ChannelInner {
    queue: String,
    tags: KeyValues,
    source: SourceId,
    admission: Arc<dyn AdmissionService>,
    settings: ChannelSettings,
    state: Mutex<ChannelState>,
    // Serializes enqueues so the squash check always sees the latest tail.
    enqueue_gate: tokio::sync::Mutex<()>,
    work: Notify,
    closed: CancellationToken,
    handoff: flume::Receiver<Dispatch>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

/// Handle to a channel actor. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("queue", &self.inner.queue)
            .field("tags", &self.inner.tags)
            .field("source", &self.inner.source)
            .finish()
    }
}

impl Channel {
    /// Creates the channel and spawns its dispatch loop. The loop ends when
    /// the channel is deleted or `shutdown` is cancelled.
    pub fn spawn(
        queue: impl Into<String>,
        tags: KeyValues,
        admission: Arc<dyn AdmissionService>,
        settings: ChannelSettings,
        shutdown: &CancellationToken,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let (tx, rx) = flume::bounded(0);
        let inner = Arc::new(ChannelInner {
            queue: queue.into(),
            tags,
            source: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            admission,
            settings,
            state: Mutex::new(ChannelState::default()),
            enqueue_gate: tokio::sync::Mutex::new(()),
            work: Notify::new(),
            closed: shutdown.child_token(),
            handoff: rx,
            events,
        });
        debug!(queue = %inner.queue, tags = %inner.tags, "channel created");
        tokio::spawn(dispatch::run(Arc::clone(&inner), tx));
        Self { inner }
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn tags(&self) -> &KeyValues {
        &self.inner.tags
    }

    /// Unique id of this channel instance, used to de-duplicate merges.
    pub fn source_id(&self) -> SourceId {
        self.inner.source
    }

    /// The handoff source the dispatch loop feeds. Ends once the loop stops.
    pub fn dequeue(&self) -> flume::Receiver<Dispatch> {
        self.inner.handoff.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().items.is_empty()
    }

    /// `(pending, in_flight)` item counts.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.inner.state.lock();
        let pending = state.pending.len();
        (pending, state.items.len().saturating_sub(pending))
    }

    /// Adds an item, squashing it into the tail when the tail is still
    /// updateable. Returns the id now holding the payload.
    pub async fn enqueue(&self, item: &EnqueueItem) -> Result<ItemId, BrokerError> {
        let inner = &self.inner;
        let _gate = inner.enqueue_gate.lock().await;

        {
            let state = inner.state.lock();
            if state.closed {
                return Err(BrokerError::ChannelDestroying);
            }
            let tail = state.pending.back().and_then(|id| state.items.get(id));
            if let Some(tail) = tail.filter(|t| t.policy().updateable) {
                tail.update(item.payload.clone(), item.policy());
                metrics::inc_squashed(1);
                debug!(queue = %inner.queue, tags = %inner.tags, item_id = %tail.id(), "squashed into tail");
                return Ok(tail.id());
            }
        }

        inner
            .admission
            .update_counter(&inner.tags, CounterKind::Enqueued, 1)
            .await?;

        let record = Arc::new(Item::new(item.payload.clone(), item.policy()));
        let id = record.id();
        {
            let mut state = inner.state.lock();
            if !state.closed {
                state.pending.push_back(id);
                state.items.insert(id, record);
                drop(state);
                inner.work.notify_one();
                metrics::inc_enqueued(1);
                debug!(queue = %inner.queue, tags = %inner.tags, item_id = %id, "enqueued");
                return Ok(id);
            }
        }

        inner.decrement(CounterKind::Enqueued).await;
        Err(BrokerError::ChannelDestroying)
    }

    /// Settles an in-flight item. Returns true when the channel holds no
    /// items afterwards.
    pub async fn ack(&self, ack: &Ack) -> Result<bool, BrokerError> {
        let inner = &self.inner;
        let item = inner.item(&ack.item_id)?;

        // A timer that can't be stopped here has already timed out, so the
        // timeout path owns the item now.
        if !item.stop_heartbeater() {
            return Err(BrokerError::NotFound(format!(
                "item {} is not in flight",
                ack.item_id
            )));
        }

        if ack.passed {
            let now_empty = {
                let mut state = inner.state.lock();
                state.items.remove(&ack.item_id);
                state.items.is_empty()
            };
            inner.decrement(CounterKind::Running).await;
            inner.decrement(CounterKind::Enqueued).await;
            metrics::inc_acked(1);
            debug!(queue = %inner.queue, tags = %inner.tags, item_id = %ack.item_id, "acked");
            Ok(now_empty)
        } else {
            inner.fail(item).await;
            Ok(self.is_empty())
        }
    }

    /// Resets the in-flight timer of `id`.
    pub fn heartbeat(&self, id: &ItemId) -> Result<(), BrokerError> {
        let item = self.inner.item(id)?;
        if item.heartbeat() {
            Ok(())
        } else {
            Err(BrokerError::NotFound(format!("item {id} is not in flight")))
        }
    }

    /// Closes the channel only if it holds no items. Returns false, leaving
    /// the dispatch loop running, otherwise.
    pub fn delete(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.closed {
            return true;
        }
        if !state.items.is_empty() {
            return false;
        }
        state.closed = true;
        drop(state);
        self.inner.closed.cancel();
        debug!(queue = %self.inner.queue, tags = %self.inner.tags, "channel deleted");
        true
    }

    /// Closes the channel regardless of content, discarding every item and
    /// zeroing its admission counters.
    pub async fn force_delete(&self) {
        let inner = &self.inner;
        let items: Vec<Arc<Item>> = {
            let mut state = inner.state.lock();
            state.closed = true;
            state.pending.clear();
            state.items.drain().map(|(_, item)| item).collect()
        };
        inner.closed.cancel();
        for item in &items {
            item.stop_heartbeater();
        }
        if let Err(err) = inner.admission.set_counters(&inner.tags, 0).await {
            warn!(queue = %inner.queue, tags = %inner.tags, error = %err, "failed to reset counters");
        }
        info!(queue = %inner.queue, tags = %inner.tags, discarded = items.len(), "channel force-deleted");
    }
}

impl ChannelInner {
    fn item(&self, id: &ItemId) -> Result<Arc<Item>, BrokerError> {
        self.state
            .lock()
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("item {id}")))
    }

    fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Decrements a counter. Failures are logged; the service stays authoritative.
    async fn decrement(&self, counter: CounterKind) {
        if let Err(err) = self.admission.update_counter(&self.tags, counter, -1).await {
            warn!(queue = %self.queue, tags = %self.tags, ?counter, error = %err, "counter decrement failed");
        }
    }

    fn remove(&self, id: &ItemId) {
        self.state.lock().items.remove(id);
    }

    /// Puts an unsettled in-flight item back at the head without counting a
    /// failure. Returns false when an ACK, a timeout or a force delete got
    /// to the item first; its running slot is then already accounted for.
    fn restore(&self, item: &Item) -> bool {
        item.stop_heartbeater() && self.requeue_front(item)
    }

    fn requeue_front(&self, item: &Item) -> bool {
        let mut state = self.state.lock();
        if state.closed || !state.items.contains_key(&item.id()) {
            return false;
        }
        state.pending.push_front(item.id());
        drop(state);
        self.work.notify_one();
        true
    }

    /// Failure path shared by a failed ACK and a heartbeat timeout. The
    /// item's timer must already be detached.
    async fn fail(&self, item: Arc<Item>) {
        let id = item.id();
        self.decrement(CounterKind::Running).await;

        if !item.record_failure() {
            self.remove(&id);
            self.decrement(CounterKind::Enqueued).await;
            metrics::inc_dropped_exhausted(1);
            warn!(queue = %self.queue, tags = %self.tags, item_id = %id, retry_count = item.retry_count(), "retries exhausted, item dropped");
            return;
        }

        let policy = item.policy();
        let requeued = {
            let mut state = self.state.lock();
            if state.closed || !state.items.contains_key(&id) {
                return;
            }

            let merged = match policy.retry_position {
                RetryPosition::Front => policy.updateable && !state.pending.is_empty(),
                RetryPosition::Back => {
                    // Same squash rule as enqueue: an updateable tail absorbs
                    // the retry. When the retry is updateable too, the tail is
                    // the newer write and keeps its payload.
                    match state.pending.back().and_then(|tail| state.items.get(tail)) {
                        Some(tail) if tail.policy().updateable => {
                            if !policy.updateable {
                                tail.update(item.payload(), policy);
                            }
                            true
                        }
                        _ => false,
                    }
                }
            };

            if merged {
                state.items.remove(&id);
                false
            } else {
                match policy.retry_position {
                    RetryPosition::Front => state.pending.push_front(id),
                    RetryPosition::Back => state.pending.push_back(id),
                }
                true
            }
        };

        if !requeued {
            self.decrement(CounterKind::Enqueued).await;
            metrics::inc_squashed(1);
            debug!(queue = %self.queue, tags = %self.tags, item_id = %id, "retry merged into a newer pending item");
            return;
        }

        self.work.notify_one();
        metrics::inc_retried(1);
        debug!(queue = %self.queue, tags = %self.tags, item_id = %id, retry_count = item.retry_count(), "requeued");
    }

    /// Heartbeat timeout of an in-flight item.
    async fn expire(self: Arc<Self>, id: ItemId) {
        let Some(item) = self.state.lock().items.get(&id).cloned() else {
            return;
        };
        item.unset_heartbeater();
        metrics::inc_timed_out(1);
        warn!(queue = %self.queue, tags = %self.tags, item_id = %id, "heartbeat timed out");

        self.fail(item).await;
        let _ = self.events.send(ChannelEvent::TryDelete {
            queue: self.queue.clone(),
            tags: self.tags.clone(),
            source: self.source,
        });
    }
}
