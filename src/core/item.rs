//! State of a single enqueued payload.
//!
//! An [`Item`] is shared between the channel that owns it and the heartbeat
//! timer watching it while in flight. ACK, timeout and dequeue-success can
//! race on the same item, so every mutation goes through the item's own lock,
//! which is never held across an await point.

use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::error::HeartbeatError;
use crate::core::heartbeat::{HeartbeatTimer, TimerCallback};

#[cfg(test)]
use crate::core::heartbeat::callback;

pub type ItemId = Uuid;

/// Where a failed item goes back into the pending list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPosition {
    #[default]
    Front,
    Back,
}

/// Delivery policy carried by each item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemPolicy {
    pub updateable: bool,
    pub max_retry_attempts: u32,
    pub retry_position: RetryPosition,
    pub heartbeat_timeout: Duration,
}

#[derive(Debug)]
pub struct ItemRecord {
    pub payload: Bytes,
    pub policy: ItemPolicy,
    pub retry_count: u32,
    heartbeat: Option<HeartbeatTimer>,
}

#[derive(Debug)]
pub struct Item {
    id: ItemId,
    record: Mutex<ItemRecord>,
}

impl Item {
    pub fn new(payload: Bytes, policy: ItemPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            record: Mutex::new(ItemRecord {
                payload,
                policy,
                retry_count: 0,
                heartbeat: None,
            }),
        }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn payload(&self) -> Bytes {
        self.record.lock().payload.clone()
    }

    pub fn policy(&self) -> ItemPolicy {
        self.record.lock().policy
    }

    pub fn retry_count(&self) -> u32 {
        self.record.lock().retry_count
    }

    /// Overwrites payload and policy in place (squash) and resets the retry count.
    pub fn update(&self, payload: Bytes, policy: ItemPolicy) {
        let mut record = self.record.lock();
        record.payload = payload;
        record.policy = policy;
        record.retry_count = 0;
    }

    /// Counts one failed attempt. Returns true while the item may still be
    /// retried, false once `retry_count` exceeds `max_retry_attempts`.
    pub fn record_failure(&self) -> bool {
        let mut record = self.record.lock();
        record.retry_count = record.retry_count.saturating_add(1);
        record.retry_count <= record.policy.max_retry_attempts
    }

    /// Attaches a new heartbeat timer in the `Created` state.
    pub fn create_heartbeater(
        &self,
        on_timeout: Option<TimerCallback>,
        cancel: CancellationToken,
    ) -> Result<(), HeartbeatError> {
        let mut record = self.record.lock();
        if record.heartbeat.is_some() {
            return Err(HeartbeatError::AlreadyAttached);
        }
        let timer = HeartbeatTimer::builder(record.policy.heartbeat_timeout)
            .cancel_on(cancel)
            .on_timeout_boxed(on_timeout)
            .spawn()?;
        record.heartbeat = Some(timer);
        Ok(())
    }

    /// Clears the timer reference without stopping it. The countdown task
    /// is detached, not aborted, and finishes on its own.
    pub fn unset_heartbeater(&self) {
        if let Some(timer) = self.record.lock().heartbeat.take() {
            timer.detach();
        }
    }

    pub fn has_heartbeater(&self) -> bool {
        self.record.lock().heartbeat.is_some()
    }

    pub fn start_heartbeater(&self) -> bool {
        self.record
            .lock()
            .heartbeat
            .as_ref()
            .is_some_and(HeartbeatTimer::start)
    }

    /// Stops and detaches the timer. Returns true only if this call stopped it.
    pub fn stop_heartbeater(&self) -> bool {
        let mut record = self.record.lock();
        let stopped = record
            .heartbeat
            .as_ref()
            .is_some_and(HeartbeatTimer::stop);
        if stopped {
            record.heartbeat = None;
        }
        stopped
    }

    pub fn heartbeat(&self) -> bool {
        self.record
            .lock()
            .heartbeat
            .as_ref()
            .is_some_and(HeartbeatTimer::heartbeat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn policy(max_retry_attempts: u32) -> ItemPolicy {
        ItemPolicy {
            updateable: false,
            max_retry_attempts,
            retry_position: RetryPosition::Front,
            heartbeat_timeout: Duration::from_millis(50),
        }
    }

    fn noop_timeout() -> Option<TimerCallback> {
        Some(callback(|| async {}))
    }

    #[test]
    fn update_squashes_payload_and_resets_retries() {
        let item = Item::new(Bytes::from_static(b"first"), policy(3));
        assert!(item.record_failure());
        assert_eq!(item.retry_count(), 1);

        let mut next = policy(5);
        next.updateable = true;
        item.update(Bytes::from_static(b"second"), next);

        assert_eq!(item.payload(), Bytes::from_static(b"second"));
        assert_eq!(item.retry_count(), 0);
        assert_eq!(item.policy(), next);
    }

    #[test]
    fn retries_exhaust_after_max_attempts() {
        let item = Item::new(Bytes::new(), policy(1));
        assert!(item.record_failure());
        assert!(!item.record_failure());
    }

    #[test]
    fn helpers_report_false_without_timer() {
        let item = Item::new(Bytes::new(), policy(0));
        assert!(!item.start_heartbeater());
        assert!(!item.stop_heartbeater());
        assert!(!item.heartbeat());
    }

    #[tokio::test]
    async fn heartbeater_can_only_be_attached_once() {
        let item = Item::new(Bytes::new(), policy(0));
        item.create_heartbeater(noop_timeout(), CancellationToken::new())
            .unwrap();
        assert_eq!(
            item.create_heartbeater(noop_timeout(), CancellationToken::new()),
            Err(HeartbeatError::AlreadyAttached)
        );

        item.unset_heartbeater();
        assert!(!item.has_heartbeater());
        item.create_heartbeater(noop_timeout(), CancellationToken::new())
            .unwrap();
    }

    #[tokio::test]
    async fn heartbeater_requires_timeout_callback() {
        let item = Item::new(Bytes::new(), policy(0));
        assert_eq!(
            item.create_heartbeater(None, CancellationToken::new()),
            Err(HeartbeatError::MissingTimeoutCallback)
        );
        assert!(!item.has_heartbeater());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_detaches_only_when_it_wins() {
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        let item = Item::new(Bytes::new(), policy(0));
        item.create_heartbeater(
            Some(callback(move || async move {
                fired.fetch_add(1, Ordering::SeqCst);
            })),
            CancellationToken::new(),
        )
        .unwrap();

        assert!(item.start_heartbeater());
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!item.stop_heartbeater());
        assert!(item.has_heartbeater());
    }
}
