use std::time::Duration;

use uuid::Uuid;

use appshot_core::broker::MessageBroker;
use appshot_core::job::{Priority, QueueMessage, Store};
use appshot_db::QueueRepository;

use crate::integration::common::setup_test_db;

const QUEUE: &str = "screenshots.playstore";

fn message(app_id: &str) -> QueueMessage {
    QueueMessage {
        job_id: Uuid::new_v4(),
        app_id: app_id.to_string(),
        store: Store::PlayStore,
        attempt: 0,
        force_refresh: false,
    }
}

#[tokio::test]
async fn claim_orders_by_priority_then_fifo() {
    let (pool, _container) = setup_test_db().await;
    let broker = QueueRepository::new(pool);

    broker
        .publish(QUEUE, &message("batch.one"), Priority::Batch, Duration::ZERO)
        .await
        .unwrap();
    broker
        .publish(QUEUE, &message("interactive.one"), Priority::Interactive, Duration::ZERO)
        .await
        .unwrap();
    broker
        .publish(QUEUE, &message("batch.two"), Priority::Batch, Duration::ZERO)
        .await
        .unwrap();

    let order: Vec<String> = [
        broker.claim(QUEUE, "w1").await.unwrap().unwrap(),
        broker.claim(QUEUE, "w1").await.unwrap().unwrap(),
        broker.claim(QUEUE, "w1").await.unwrap().unwrap(),
    ]
    .into_iter()
    .map(|d| d.message.app_id)
    .collect();

    assert_eq!(order, vec!["interactive.one", "batch.one", "batch.two"]);
    assert!(broker.claim(QUEUE, "w1").await.unwrap().is_none());
}

#[tokio::test]
async fn queues_are_isolated() {
    let (pool, _container) = setup_test_db().await;
    let broker = QueueRepository::new(pool);

    broker
        .publish(QUEUE, &message("com.example.app"), Priority::Interactive, Duration::ZERO)
        .await
        .unwrap();

    assert!(broker.claim("screenshots.appstore", "w1").await.unwrap().is_none());
    assert_eq!(broker.depth(QUEUE).await.unwrap(), 1);
    assert_eq!(broker.depth("screenshots.appstore").await.unwrap(), 0);
}

#[tokio::test]
async fn delayed_message_is_not_claimable_yet() {
    let (pool, _container) = setup_test_db().await;
    let broker = QueueRepository::new(pool);

    broker
        .publish(QUEUE, &message("com.example.app"), Priority::Interactive, Duration::from_secs(60))
        .await
        .unwrap();

    assert!(broker.claim(QUEUE, "w1").await.unwrap().is_none());
    assert_eq!(broker.depth(QUEUE).await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_claims_deliver_each_message_once() {
    let (pool, _container) = setup_test_db().await;
    let broker = QueueRepository::new(pool);

    for i in 0..10 {
        broker
            .publish(QUEUE, &message(&format!("app.{i}")), Priority::Batch, Duration::ZERO)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..4 {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(d) = broker.claim(QUEUE, &format!("w{w}")).await.unwrap() {
                claimed.push(d.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 10);
}

#[tokio::test]
async fn unacked_message_reappears_after_visibility_timeout() {
    let (pool, _container) = setup_test_db().await;
    let broker = QueueRepository::new(pool).with_visibility_timeout(Duration::from_millis(200));

    broker
        .publish(QUEUE, &message("com.example.app"), Priority::Interactive, Duration::ZERO)
        .await
        .unwrap();

    let first = broker.claim(QUEUE, "w1").await.unwrap().unwrap();
    assert_eq!(first.delivery_count, 1);
    assert!(broker.claim(QUEUE, "w2").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;

    let second = broker.claim(QUEUE, "w2").await.unwrap().unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.delivery_count, 2);
}

#[tokio::test]
async fn ack_and_reschedule() {
    let (pool, _container) = setup_test_db().await;
    let broker = QueueRepository::new(pool);

    broker
        .publish(QUEUE, &message("com.example.app"), Priority::Interactive, Duration::ZERO)
        .await
        .unwrap();
    let delivery = broker.claim(QUEUE, "w1").await.unwrap().unwrap();

    assert!(broker.reschedule(&delivery, 2, Duration::ZERO).await.unwrap());
    let again = broker.claim(QUEUE, "w1").await.unwrap().unwrap();
    assert_eq!(again.id, delivery.id);
    assert_eq!(again.message.attempt, 2);

    assert!(broker.ack(&again).await.unwrap());
    assert!(!broker.ack(&again).await.unwrap());
    assert!(!broker.reschedule(&again, 3, Duration::ZERO).await.unwrap());
    assert_eq!(broker.depth(QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn expired_lease_cannot_ack_or_reschedule() {
    let (pool, _container) = setup_test_db().await;
    let broker = QueueRepository::new(pool).with_visibility_timeout(Duration::from_millis(200));

    broker
        .publish(QUEUE, &message("com.example.app"), Priority::Interactive, Duration::ZERO)
        .await
        .unwrap();
    let stale = broker.claim(QUEUE, "w1").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let current = broker.claim(QUEUE, "w2").await.unwrap().unwrap();
    assert_eq!(current.id, stale.id);

    assert!(!broker.ack(&stale).await.unwrap());
    assert!(!broker.reschedule(&stale, 1, Duration::ZERO).await.unwrap());
    assert_eq!(broker.depth(QUEUE).await.unwrap(), 1);

    assert!(broker.ack(&current).await.unwrap());
    assert_eq!(broker.depth(QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn force_refresh_survives_the_round_trip() {
    let (pool, _container) = setup_test_db().await;
    let broker = QueueRepository::new(pool);

    let forced = message("com.example.app").with_force_refresh(true);
    broker
        .publish(QUEUE, &forced, Priority::Interactive, Duration::ZERO)
        .await
        .unwrap();
    let delivery = broker.claim(QUEUE, "w1").await.unwrap().unwrap();
    assert!(delivery.message.force_refresh);
}
