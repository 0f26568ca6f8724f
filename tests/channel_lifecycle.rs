mod common;

use common::*;
use tagmq::core::admission::CounterKind;
use tagmq::{BrokerError, TagQuery};

#[tokio::test]
async fn channel_stays_while_items_remain() {
    let (coordinator, _admission) = engine();
    let t = tags(&[("k", "v")]);
    let a = coordinator.enqueue("q", item("a", t.clone())).await.unwrap();
    let b = coordinator.enqueue("q", item("b", t.clone())).await.unwrap();

    dequeue(&coordinator, "q", TagQuery::Any).await.commit();
    coordinator.ack("q", ack(a, &t, true)).await.unwrap();
    assert_eq!(coordinator.channels("q", &TagQuery::Any).len(), 1);

    dequeue(&coordinator, "q", TagQuery::Any).await.commit();
    coordinator.ack("q", ack(b, &t, true)).await.unwrap();
    assert!(coordinator.channels("q", &TagQuery::Any).is_empty());
    assert!(coordinator.queues().is_empty());

    // A fresh enqueue recreates it.
    coordinator.enqueue("q", item("c", t.clone())).await.unwrap();
    assert_eq!(coordinator.channels("q", &TagQuery::Any).len(), 1);
}

#[tokio::test]
async fn force_delete_ignores_contents() {
    let (coordinator, admission) = engine();
    let t = tags(&[("k", "v")]);
    coordinator.enqueue("q", item("a", t.clone())).await.unwrap();
    let in_flight = dequeue(&coordinator, "q", TagQuery::Any).await.commit();
    coordinator.enqueue("q", item("b", t.clone())).await.unwrap();

    assert!(coordinator.delete_channel("q", &t).await);
    assert!(!coordinator.delete_channel("q", &t).await);
    assert!(coordinator.channels("q", &TagQuery::Any).is_empty());
    assert_eq!(admission.counter(&t, CounterKind::Enqueued), 0);
    assert_eq!(admission.counter(&t, CounterKind::Running), 0);
    assert!(matches!(
        coordinator.ack("q", ack(in_flight.id, &t, true)).await,
        Err(BrokerError::NotFound(_))
    ));
}

#[tokio::test]
async fn destroying_a_queue_removes_all_its_channels() {
    let (coordinator, _admission) = engine();
    for shard in ["1", "2", "3"] {
        coordinator
            .enqueue("q", item("x", tags(&[("shard", shard)])))
            .await
            .unwrap();
    }
    coordinator.enqueue("keep", item("x", tags(&[("shard", "1")]))).await.unwrap();

    assert_eq!(coordinator.destroy_channels_for_queue("q").await, 3);
    assert_eq!(coordinator.destroy_channels_for_queue("q").await, 0);
    assert!(coordinator.channels("q", &TagQuery::Any).is_empty());
    assert_eq!(coordinator.channels("keep", &TagQuery::Any).len(), 1);
}
