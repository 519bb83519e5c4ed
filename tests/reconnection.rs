mod common;

use std::sync::Arc;
use std::time::Duration;

use blipmq_client::core::dlq::DeadLetterReason;
use blipmq_client::core::queue::FailurePolicy;
use blipmq_client::{ClientError, ConnectQos, ConnectionState, Priority, RequestState};

use common::{client_with, failsafe_config, msg, RecordingListener};

#[tokio::test(start_paused = true)]
async fn backlog_is_replayed_in_priority_order_after_reconnect() {
    let listener = Arc::new(RecordingListener::default());
    let (client, broker) = client_with(failsafe_config(-1, 100), Some(listener.clone()));
    client.connect(ConnectQos::new("alice")).await.unwrap();

    broker.set_available(false);
    let first = client.publish(msg("a", Priority::NORM)).await.unwrap();
    assert_eq!(first.state, RequestState::Queued);
    assert_eq!(client.state(), ConnectionState::Polling);

    for (key, prio) in [("b", Priority::LOW), ("c", Priority::HIGH), ("d", Priority::MAX)] {
        let ret = client.publish(msg(key, prio)).await.unwrap();
        assert_eq!(ret.state, RequestState::Queued);
    }
    assert_eq!(client.queue().len(), 4);

    broker.set_available(true);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(client.state(), ConnectionState::Alive);
    assert_eq!(broker.delivered_keys(), vec!["d", "c", "a", "b"]);
    assert_eq!(broker.batch_sizes(), vec![4]);
    assert!(client.queue().is_empty());
    assert_eq!(
        listener.seen(),
        vec![
            (ConnectionState::Alive, ConnectionState::Polling),
            (ConnectionState::Polling, ConnectionState::Alive),
        ]
    );
    assert_eq!(client.metrics().snapshot().reconnects, 1);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_dead_letter_the_backlog() {
    let (client, broker) = client_with(failsafe_config(2, 100), None);
    client.connect(ConnectQos::new("bob")).await.unwrap();

    broker.set_available(false);
    client.publish(msg("x", Priority::NORM)).await.unwrap();
    client.publish(msg("y", Priority::NORM)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(client.state(), ConnectionState::Dead);
    // the explicit connect plus two polling attempts
    assert_eq!(broker.connect_count(), 3);
    assert!(client.queue().is_empty());
    let letters = client.dead_letters().drain();
    assert_eq!(letters.len(), 2);
    assert!(letters.iter().all(|l| l.reason == DeadLetterReason::Exhausted));

    let err = client.publish(msg("z", Priority::NORM)).await.unwrap_err();
    assert!(matches!(err, ClientError::Dead));

    broker.set_available(true);
    client.connect(ConnectQos::new("bob")).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Alive);
    let ret = client.publish(msg("z", Priority::NORM)).await.unwrap();
    assert_eq!(ret.state, RequestState::Ok);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn keep_policy_retains_backlog_when_dead() {
    let mut cfg = failsafe_config(1, 100);
    cfg.queue.on_failure = FailurePolicy::Keep;
    let (client, broker) = client_with(cfg, None);
    client.connect(ConnectQos::new("carol")).await.unwrap();

    broker.set_available(false);
    client.publish(msg("kept", Priority::NORM)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(client.state(), ConnectionState::Dead);
    assert_eq!(client.queue().len(), 1);
    assert!(client.dead_letters().is_empty());
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_ping_starts_polling_without_traffic() {
    let listener = Arc::new(RecordingListener::default());
    let (client, broker) = client_with(failsafe_config(-1, 100), Some(listener.clone()));
    client.connect(ConnectQos::new("dave")).await.unwrap();

    broker.set_available(false);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(client.state(), ConnectionState::Polling);
    assert_eq!(client.metrics().snapshot().ping_failures, 1);

    broker.set_available(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.state(), ConnectionState::Alive);
    assert_eq!(listener.seen().len(), 2);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn held_backlog_waits_for_flush() {
    let listener = Arc::new(RecordingListener::holding());
    let (client, broker) = client_with(failsafe_config(-1, 100), Some(listener));
    client.connect(ConnectQos::new("erin")).await.unwrap();

    broker.set_available(false);
    client.publish(msg("held", Priority::NORM)).await.unwrap();
    broker.set_available(true);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(client.state(), ConnectionState::Alive);
    assert_eq!(client.queue().len(), 1);
    assert!(broker.delivered().is_empty());

    client.flush_queue();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.delivered_keys(), vec!["held"]);
    assert!(client.queue().is_empty());
    client.shutdown().await;
}
