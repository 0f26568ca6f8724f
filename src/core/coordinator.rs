//! Queue-level entry point: channel directory plus dequeue fan-in.
//!
//! A blocking [`Coordinator::dequeue`] registers itself as a waiting
//! consumer *before* it scans the directory for matching channels. An
//! enqueue that creates a channel inserts it into the directory *before*
//! it scans the waiting consumers. Whichever side runs second sees the
//! other, so a consumer never misses a channel created while it waits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::BrokerConfig;
use crate::core::admission::AdmissionService;
use crate::core::channel::{Channel, ChannelEvent, ChannelSettings, Delivery, Dispatch};
use crate::core::error::BrokerError;
use crate::core::item::ItemId;
use crate::core::merge::{merge_read, MergeHandle, SourceId};
use crate::core::message::{Ack, ChannelInfo, EnqueueItem, HeartbeatMsg};
use crate::core::tags::{KeyValues, TagQuery};

/// Queue name to tag set to channel.
#[derive(Debug, Default)]
pub struct ChannelDirectory {
    queues: DashMap<String, DashMap<KeyValues, Channel>>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, queue: &str, tags: &KeyValues) -> Option<Channel> {
        self.queues
            .get(queue)
            .and_then(|channels| channels.get(tags).map(|c| c.clone()))
    }

    /// Returns the live channel for `(queue, tags)`, creating it with `make`
    /// if there is none. The flag is true when the channel was created here.
    pub fn create_or_find(
        &self,
        queue: &str,
        tags: &KeyValues,
        make: impl FnOnce() -> Channel,
    ) -> (Channel, bool) {
        let channels = self.queues.entry(queue.to_string()).or_default();
        let found = match channels.entry(tags.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_closed() {
                    let fresh = make();
                    existing.insert(fresh.clone());
                    (fresh, true)
                } else {
                    (existing.get().clone(), false)
                }
            }
            Entry::Vacant(slot) => {
                let fresh = make();
                slot.insert(fresh.clone());
                (fresh, true)
            }
        };
        found
    }

    /// Channels of `queue` whose tag set matches `query`.
    pub fn matching(&self, queue: &str, query: &TagQuery) -> Vec<Channel> {
        self.queues
            .get(queue)
            .map(|channels| {
                channels
                    .iter()
                    .filter(|entry| query.matches(entry.key()))
                    .map(|entry| entry.value().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes the channel only if it is empty, closing it in the same
    /// critical section. With `source` set, only that channel instance is
    /// eligible.
    pub fn delete_if_empty(&self, queue: &str, tags: &KeyValues, source: Option<SourceId>) -> bool {
        let removed = match self.queues.get(queue) {
            Some(channels) => channels
                .remove_if(tags, |_, channel| {
                    source.map_or(true, |s| channel.source_id() == s) && channel.delete()
                })
                .is_some(),
            None => false,
        };
        if removed {
            self.queues.remove_if(queue, |_, channels| channels.is_empty());
        }
        removed
    }

    /// Unconditionally unlinks a channel. The caller destroys it.
    pub fn remove(&self, queue: &str, tags: &KeyValues) -> Option<Channel> {
        let removed = self
            .queues
            .get(queue)
            .and_then(|channels| channels.remove(tags).map(|(_, c)| c));
        if removed.is_some() {
            self.queues.remove_if(queue, |_, channels| channels.is_empty());
        }
        removed
    }

    /// Unlinks every channel of `queue`.
    pub fn remove_queue(&self, queue: &str) -> Vec<Channel> {
        self.queues
            .remove(queue)
            .map(|(_, channels)| channels.into_iter().map(|(_, c)| c).collect())
            .unwrap_or_default()
    }

    /// Unlinks every channel of every queue.
    pub fn drain(&self) -> Vec<Channel> {
        let queues: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        queues.iter().flat_map(|q| self.remove_queue(q)).collect()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }
}

struct Waiter {
    queue: String,
    query: TagQuery,
    merge: MergeHandle<Dispatch>,
}

/// Removes a waiting consumer on every exit path of `dequeue`.
struct Registration<'a> {
    waiting: &'a Mutex<HashMap<u64, Waiter>>,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.waiting.lock().remove(&self.id);
    }
}

struct CoordinatorInner {
    admission: Arc<dyn AdmissionService>,
    settings: ChannelSettings,
    min_heartbeat_timeout: Duration,
    directory: ChannelDirectory,
    waiting: Mutex<HashMap<u64, Waiter>>,
    next_waiter: AtomicU64,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl CoordinatorInner {
    fn new_channel(&self, queue: &str, tags: &KeyValues) -> Channel {
        Channel::spawn(
            queue,
            tags.clone(),
            Arc::clone(&self.admission),
            self.settings,
            &self.shutdown,
            self.events.clone(),
        )
    }

    fn register(&self, queue: &str, query: TagQuery, merge: MergeHandle<Dispatch>) -> Registration<'_> {
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        self.waiting.lock().insert(
            id,
            Waiter {
                queue: queue.to_string(),
                query,
                merge,
            },
        );
        Registration {
            waiting: &self.waiting,
            id,
        }
    }

    /// Hands a newly created channel to every waiting consumer it matches.
    fn fold_into_waiters(&self, channel: &Channel) {
        let waiting = self.waiting.lock();
        for waiter in waiting.values() {
            if waiter.queue == channel.queue() && waiter.query.matches(channel.tags()) {
                waiter.merge.merge(channel.source_id(), channel.dequeue());
            }
        }
    }
}

/// Owns every channel of every queue and serves producers and consumers.
///
/// Cheap to clone. Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    pub fn new(admission: Arc<dyn AdmissionService>, config: &BrokerConfig) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let inner = Arc::new(CoordinatorInner {
            admission,
            settings: config.channel_settings(),
            min_heartbeat_timeout: config.min_heartbeat_timeout(),
            directory: ChannelDirectory::new(),
            waiting: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
            shutdown: shutdown.clone(),
            events,
        });
        tokio::spawn(run_events(Arc::downgrade(&inner), rx, shutdown));
        Self { inner }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of consumers currently blocked in [`Coordinator::dequeue`].
    pub fn waiting_consumers(&self) -> usize {
        self.inner.waiting.lock().len()
    }

    /// Validates and stores an item, creating its channel on demand.
    #[instrument(skip(self, item), fields(tags = %item.tags))]
    pub async fn enqueue(&self, queue: &str, item: EnqueueItem) -> Result<ItemId, BrokerError> {
        item.validate(self.inner.min_heartbeat_timeout)?;
        let inner = &self.inner;

        loop {
            if inner.shutdown.is_cancelled() {
                return Err(BrokerError::ShuttingDown);
            }

            let (channel, created) = inner
                .directory
                .create_or_find(queue, &item.tags, || inner.new_channel(queue, &item.tags));
            if created {
                inner.fold_into_waiters(&channel);
            }

            match channel.enqueue(&item).await {
                Ok(id) => return Ok(id),
                // Closed between lookup and use; resolve again.
                Err(BrokerError::ChannelDestroying) => {
                    debug!(%queue, tags = %item.tags, "channel closing, retrying enqueue");
                    tokio::task::yield_now().await;
                }
                Err(err) => {
                    if created {
                        inner
                            .directory
                            .delete_if_empty(queue, &item.tags, Some(channel.source_id()));
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Blocks until an item from any channel of `queue` matching `query` is
    /// admitted, the caller cancels, or the coordinator shuts down.
    ///
    /// The returned [`Delivery`] must be committed once the item reached the
    /// consumer, or aborted if it could not be handed over.
    #[instrument(skip(self, cancel))]
    pub async fn dequeue(
        &self,
        queue: &str,
        query: TagQuery,
        cancel: CancellationToken,
    ) -> Result<Delivery, BrokerError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(BrokerError::ShuttingDown);
        }

        let (merge, mut reader) = merge_read();
        let _registration = inner.register(queue, query.clone(), merge.clone());
        for channel in inner.directory.matching(queue, &query) {
            merge.merge(channel.source_id(), channel.dequeue());
        }
        drop(merge);

        loop {
            let next = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => return Err(BrokerError::ShuttingDown),
                _ = cancel.cancelled() => return Err(BrokerError::ClientCancelled),
                next = reader.next() => next,
            };
            let Some(dispatch) = next else {
                return Err(BrokerError::Internal("merge read ended while registered".into()));
            };

            // None: that channel is blocked by admission right now; keep
            // waiting on the rest.
            if let Some(delivery) = dispatch.invoke().await? {
                return Ok(delivery);
            }
        }
    }

    /// Settles an in-flight item and removes its channel once empty.
    #[instrument(skip(self, ack), fields(item_id = %ack.item_id, passed = ack.passed))]
    pub async fn ack(&self, queue: &str, ack: Ack) -> Result<(), BrokerError> {
        let channel = self.channel(queue, &ack.tags)?;
        if channel.ack(&ack).await? {
            self.inner
                .directory
                .delete_if_empty(queue, &ack.tags, Some(channel.source_id()));
        }
        Ok(())
    }

    pub fn heartbeat(&self, queue: &str, msg: &HeartbeatMsg) -> Result<(), BrokerError> {
        self.channel(queue, &msg.tags)?.heartbeat(&msg.item_id)
    }

    /// Force-deletes one channel. Returns false if it was already gone.
    #[instrument(skip(self))]
    pub async fn delete_channel(&self, queue: &str, tags: &KeyValues) -> bool {
        match self.inner.directory.remove(queue, tags) {
            Some(channel) => {
                channel.force_delete().await;
                true
            }
            None => {
                debug!(%queue, %tags, "channel already gone");
                false
            }
        }
    }

    /// Force-deletes every channel of `queue`. Returns how many were destroyed.
    #[instrument(skip(self))]
    pub async fn destroy_channels_for_queue(&self, queue: &str) -> usize {
        let channels = self.inner.directory.remove_queue(queue);
        for channel in &channels {
            channel.force_delete().await;
        }
        info!(%queue, destroyed = channels.len(), "queue channels destroyed");
        channels.len()
    }

    pub fn channels(&self, queue: &str, query: &TagQuery) -> Vec<ChannelInfo> {
        self.inner
            .directory
            .matching(queue, query)
            .into_iter()
            .map(|channel| {
                let (pending, in_flight) = channel.counts();
                ChannelInfo {
                    queue: channel.queue().to_string(),
                    tags: channel.tags().clone(),
                    pending,
                    in_flight,
                }
            })
            .collect()
    }

    pub fn queues(&self) -> Vec<String> {
        self.inner.directory.queue_names()
    }

    /// Irreversibly stops everything: waiting consumers get
    /// [`BrokerError::ShuttingDown`] and every channel is force-deleted.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("coordinator shutting down");
        self.inner.shutdown.cancel();
        let channels = self.inner.directory.drain();
        for channel in &channels {
            channel.force_delete().await;
        }
        info!(destroyed = channels.len(), "coordinator stopped");
    }

    fn channel(&self, queue: &str, tags: &KeyValues) -> Result<Channel, BrokerError> {
        self.inner
            .directory
            .find(queue, tags)
            .ok_or_else(|| BrokerError::NotFound(format!("channel {tags} in queue '{queue}'")))
    }
}

async fn run_events(
    inner: Weak<CoordinatorInner>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(ChannelEvent::TryDelete { queue, tags, source }) = event else {
            break;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.directory.delete_if_empty(&queue, &tags, Some(source)) {
            debug!(%queue, %tags, "empty channel removed after timeout");
        }
    }
    debug!("channel event loop stopped");
}
