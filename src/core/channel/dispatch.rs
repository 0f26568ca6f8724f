//! Sequential dispatch protocol of a channel.
//!
//! The loop offers one [`Dispatch`] at a time over a zero-capacity handoff
//! and waits for the consumer to report how it went before offering the
//! next one. At most one dispatch per channel is ever in progress.
//!
//! When the admission service refuses to count another running item, the
//! loop checks whether any matched limit is actually saturated. If none is,
//! the same candidate is offered again right away; otherwise it sleeps a
//! poll interval and checks again. An unreachable admission service is
//! never treated as "admit": the loop keeps the candidate and backs off
//! exponentially until the service answers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::ChannelInner;
use crate::core::admission::{CounterKind, Limit, LIMIT_BLOCKED};
use crate::core::error::{AdmissionError, BrokerError};
use crate::core::heartbeat::callback;
use crate::core::item::Item;
use crate::core::message::DequeueItem;
use crate::core::tags::TagQuery;
use crate::metrics;

/// What a consumer reports back to the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Handed over; the loop may offer the next candidate.
    Delivered,
    /// Not handed over; the item is back in the pending list.
    Failed,
    /// Admission refused to count another running item.
    Blocked,
}

/// One offered candidate. Invoking it runs the admission check and, if
/// admitted, pops the head item.
///
/// Dropping a `Dispatch` without invoking it tells the loop to offer again.
pub struct Dispatch {
    inner: Arc<ChannelInner>,
    report: oneshot::Sender<Outcome>,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("queue", &self.inner.queue)
            .field("tags", &self.inner.tags)
            .finish()
    }
}

impl Dispatch {
    /// Returns `Ok(None)` when admission is currently blocked for this
    /// channel; the caller should keep waiting on its other sources.
    pub async fn invoke(self) -> Result<Option<Delivery>, BrokerError> {
        let Dispatch { inner, report } = self;

        match inner
            .admission
            .update_counter(&inner.tags, CounterKind::Running, 1)
            .await
        {
            Ok(()) => {}
            Err(AdmissionError::LimitReached { rule, limit }) => {
                metrics::inc_admission_blocked(1);
                debug!(queue = %inner.queue, tags = %inner.tags, %rule, limit, "dispatch blocked by admission");
                inner.work.notify_one();
                let _ = report.send(Outcome::Blocked);
                return Ok(None);
            }
            Err(AdmissionError::Transport(msg)) => {
                warn!(queue = %inner.queue, tags = %inner.tags, error = %msg, "admission service unreachable on dispatch");
                let _ = report.send(Outcome::Blocked);
                return Err(BrokerError::TransportFault(msg));
            }
        }

        let item = {
            let mut state = inner.state.lock();
            match state.pending.pop_front() {
                Some(id) if !state.closed => state.items.get(&id).cloned(),
                _ => None,
            }
        };
        let Some(item) = item else {
            inner.decrement(CounterKind::Running).await;
            let _ = report.send(Outcome::Failed);
            return Ok(None);
        };

        let id = item.id();
        let weak = Arc::downgrade(&inner);
        let on_timeout = callback(move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.expire(id).await;
            }
        });
        if let Err(err) = item.create_heartbeater(Some(on_timeout), inner.closed.clone()) {
            error!(queue = %inner.queue, tags = %inner.tags, item_id = %id, error = %err, "cannot arm heartbeat");
            if inner.requeue_front(&item) {
                inner.decrement(CounterKind::Running).await;
            }
            let _ = report.send(Outcome::Failed);
            return Err(err.into());
        }

        let dequeued = DequeueItem {
            id,
            tags: inner.tags.clone(),
            payload: item.payload(),
            heartbeat_timeout: item.policy().heartbeat_timeout,
        };
        Ok(Some(Delivery {
            dequeued,
            item,
            inner,
            report: Some(report),
        }))
    }
}

/// An item handed to a consumer but not yet confirmed as delivered.
///
/// [`Delivery::commit`] arms the heartbeat countdown and releases the
/// channel's dispatch loop. [`Delivery::abort`] puts the item back at the
/// head without counting a retry. Dropping an unresolved delivery aborts it.
pub struct Delivery {
    dequeued: DequeueItem,
    item: Arc<Item>,
    inner: Arc<ChannelInner>,
    report: Option<oneshot::Sender<Outcome>>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("item", &self.dequeued)
            .finish()
    }
}

impl Delivery {
    pub fn item(&self) -> &DequeueItem {
        &self.dequeued
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Confirms the handover and starts the heartbeat countdown.
    pub fn commit(mut self) -> DequeueItem {
        self.item.start_heartbeater();
        if let Some(report) = self.report.take() {
            let _ = report.send(Outcome::Delivered);
        }
        metrics::inc_delivered(1);
        debug!(queue = %self.inner.queue, tags = %self.inner.tags, item_id = %self.dequeued.id, "delivered");
        self.dequeued.clone()
    }

    /// The handover failed: release the running slot and requeue at the head.
    pub async fn abort(mut self) {
        let Some(report) = self.report.take() else {
            return;
        };
        if self.inner.restore(&self.item) {
            self.inner.decrement(CounterKind::Running).await;
        }
        let _ = report.send(Outcome::Failed);
        debug!(queue = %self.inner.queue, tags = %self.inner.tags, item_id = %self.dequeued.id, "delivery aborted");
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        let Some(report) = self.report.take() else {
            return;
        };
        if !self.inner.restore(&self.item) {
            let _ = report.send(Outcome::Failed);
            return;
        }
        warn!(queue = %self.inner.queue, tags = %self.inner.tags, item_id = %self.dequeued.id, "delivery dropped unresolved, requeued");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move {
                    inner.decrement(CounterKind::Running).await;
                    let _ = report.send(Outcome::Failed);
                });
            }
            Err(_) => {
                let _ = report.send(Outcome::Failed);
            }
        }
    }
}

/// The dispatch loop. Runs until the channel closes.
pub(super) async fn run(inner: Arc<ChannelInner>, tx: flume::Sender<Dispatch>) {
    let mut admission = AdmissionWait::new(&inner);

    'work: loop {
        tokio::select! {
            biased;
            _ = inner.closed.cancelled() => break 'work,
            _ = inner.work.notified() => {}
        }
        if inner.pending_len() == 0 {
            continue;
        }

        loop {
            let (report_tx, report_rx) = oneshot::channel();
            let offer = Dispatch {
                inner: Arc::clone(&inner),
                report: report_tx,
            };

            tokio::select! {
                biased;
                _ = inner.closed.cancelled() => break 'work,
                sent = tx.send_async(offer) => {
                    if sent.is_err() {
                        break 'work;
                    }
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = inner.closed.cancelled() => break 'work,
                outcome = report_rx => outcome.ok(),
            };

            match outcome {
                Some(Outcome::Blocked) => {
                    if !admission.wait(&inner).await {
                        break 'work;
                    }
                }
                Some(Outcome::Delivered) | Some(Outcome::Failed) => {
                    admission.reset();
                    break;
                }
                // Offer dropped without an answer: offer again later.
                None => break,
            }
        }

        if inner.pending_len() > 0 {
            inner.work.notify_one();
        }
    }

    // Offers still parked in the handoff hold a reference to the channel.
    drop(inner.handoff.drain());
    debug!(queue = %inner.queue, tags = %inner.tags, "dispatch loop stopped");
}

/// Admission-blocked retry state of one dispatch loop.
struct AdmissionWait {
    poll: Duration,
    max_backoff: Duration,
    backoff: Duration,
    retried_clear: bool,
}

impl AdmissionWait {
    fn new(inner: &ChannelInner) -> Self {
        let poll = inner.settings.admission_poll_interval;
        Self {
            poll,
            max_backoff: inner.settings.admission_max_backoff.max(poll),
            backoff: poll,
            retried_clear: false,
        }
    }

    fn reset(&mut self) {
        self.backoff = self.poll;
        self.retried_clear = false;
    }

    /// Waits until dispatch is worth retrying. Returns false if the channel
    /// closed meanwhile.
    async fn wait(&mut self, inner: &ChannelInner) -> bool {
        loop {
            let delay = match saturated(inner).await {
                // Nothing matched is full, so the refusal was transient. Retry
                // at once, but only once in a row.
                Ok(false) if !self.retried_clear => {
                    self.retried_clear = true;
                    self.backoff = self.poll;
                    return true;
                }
                Ok(_) => {
                    self.backoff = self.poll;
                    debug!(queue = %inner.queue, tags = %inner.tags, poll_ms = self.poll.as_millis() as u64, "admission saturated");
                    self.poll
                }
                Err(err) => {
                    let delay = self.backoff;
                    self.backoff = (self.backoff * 2).min(self.max_backoff);
                    warn!(queue = %inner.queue, tags = %inner.tags, error = %err, backoff_ms = delay.as_millis() as u64, "admission service unreachable, holding dispatch");
                    delay
                }
            };

            tokio::select! {
                biased;
                _ = inner.closed.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            self.retried_clear = false;
        }
    }
}

/// True when any running-counter limit matched for this channel is full.
pub(super) async fn saturated(inner: &ChannelInner) -> Result<bool, AdmissionError> {
    let rules = inner.admission.match_rules(&inner.tags).await?;
    let overrides = inner.admission.match_overrides(&inner.tags).await?;

    let overridden: HashSet<&str> = overrides.iter().map(|o| o.rule.as_str()).collect();
    let limits: Vec<&Limit> = overrides
        .iter()
        .chain(rules.iter().filter(|r| !overridden.contains(r.rule.as_str())))
        .filter(|l| l.counter == CounterKind::Running)
        .collect();

    for limit in limits {
        match limit.limit {
            LIMIT_BLOCKED => return Ok(true),
            l if l < 0 => continue,
            l => {
                let total: i64 = inner
                    .admission
                    .query_counters(&TagQuery::Subset(limit.selection.clone()), CounterKind::Running)
                    .await?
                    .iter()
                    .map(|c| c.value)
                    .sum();
                if total >= l {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}
