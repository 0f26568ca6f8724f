mod common;

use std::time::Duration;

use common::*;
use tagmq::core::item::RetryPosition;
use tagmq::{EnqueueItem, HeartbeatMsg, TagQuery};

#[tokio::test]
async fn heartbeats_keep_an_item_alive() {
    let (coordinator, _admission) = engine();
    let t = tags(&[("k", "v")]);
    let id = coordinator
        .enqueue("q", EnqueueItem::new("x", t.clone(), Duration::from_millis(200)))
        .await
        .unwrap();
    dequeue(&coordinator, "q", TagQuery::Any).await.commit();

    let beat = HeartbeatMsg {
        item_id: id,
        tags: t.clone(),
    };
    for _ in 0..12 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.heartbeat("q", &beat).unwrap();
    }

    coordinator.ack("q", ack(id, &t, true)).await.unwrap();
    assert!(coordinator.channels("q", &TagQuery::Any).is_empty());
}

#[tokio::test]
async fn silent_consumer_loses_the_item_to_the_next_one() {
    let (coordinator, _admission) = engine();
    let t = tags(&[("k", "v")]);
    let id = coordinator
        .enqueue(
            "q",
            EnqueueItem::new("x", t.clone(), Duration::from_millis(150))
                .retries(3, RetryPosition::Front),
        )
        .await
        .unwrap();
    dequeue(&coordinator, "q", TagQuery::Any).await.commit();

    // No heartbeat and no ACK: the timeout requeues it on its own.
    let again = dequeue(&coordinator, "q", TagQuery::Any).await.commit();
    assert_eq!(again.id, id);

    let stale = HeartbeatMsg {
        item_id: id,
        tags: t.clone(),
    };
    coordinator.heartbeat("q", &stale).unwrap();
    coordinator.ack("q", ack(id, &t, true)).await.unwrap();
}

#[tokio::test]
async fn exhausted_timeout_removes_the_channel() {
    let (coordinator, _admission) = engine();
    let t = tags(&[("k", "v")]);
    let id = coordinator
        .enqueue("q", EnqueueItem::new("x", t.clone(), Duration::from_millis(100)))
        .await
        .unwrap();
    dequeue(&coordinator, "q", TagQuery::Any).await.commit();

    assert!(eventually(|| coordinator.channels("q", &TagQuery::Any).is_empty()).await);
    let beat = HeartbeatMsg { item_id: id, tags: t };
    assert!(matches!(
        coordinator.heartbeat("q", &beat),
        Err(tagmq::BrokerError::NotFound(_))
    ));
}
