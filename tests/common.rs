#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use tagmq::config::BrokerConfig;
use tagmq::core::channel::Delivery;
use tagmq::{Ack, Coordinator, EnqueueItem, KeyValues, LocalAdmission, TagQuery};
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(3);

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tagmq::logging::init_logging("debug");
    });
}

/// Broker settings scaled down so timing tests finish quickly.
pub fn fast_config() -> BrokerConfig {
    BrokerConfig {
        admission_poll_interval_ms: 50,
        admission_max_backoff_ms: 200,
        min_heartbeat_timeout_ms: 100,
    }
}

pub fn engine() -> (Coordinator, Arc<LocalAdmission>) {
    init_logging();
    let admission = Arc::new(LocalAdmission::new());
    let coordinator = Coordinator::new(admission.clone(), &fast_config());
    (coordinator, admission)
}

pub fn tags(pairs: &[(&str, &str)]) -> KeyValues {
    pairs.iter().copied().collect()
}

pub fn item(payload: &'static str, tags: KeyValues) -> EnqueueItem {
    EnqueueItem::new(payload, tags, Duration::from_secs(5))
}

pub fn ack(id: uuid::Uuid, tags: &KeyValues, passed: bool) -> Ack {
    Ack {
        item_id: id,
        tags: tags.clone(),
        passed,
    }
}

pub async fn dequeue(coordinator: &Coordinator, queue: &str, query: TagQuery) -> Delivery {
    tokio::time::timeout(WAIT, coordinator.dequeue(queue, query, CancellationToken::new()))
        .await
        .expect("dequeue timed out")
        .expect("dequeue failed")
}

/// Polls `check` until it holds or `WAIT` elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
