mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use blipmq_client::config::QueueConfig;
use blipmq_client::core::dlq::DeadLetterQueue;
use blipmq_client::core::queue::{ClientQueue, OverflowPolicy, QueueEntry};
use blipmq_client::metrics::ClientMetrics;
use blipmq_client::{ConnectQos, MethodName, Priority, RequestState};

use common::{client_with, failsafe_config, msg};

#[tokio::test(start_paused = true)]
async fn replay_is_priority_first_then_fifo() {
    let (client, broker) = client_with(failsafe_config(-1, 100), None);
    client.connect(ConnectQos::new("ord")).await.unwrap();
    broker.set_available(false);

    let mut expected: Vec<(u8, usize)> = Vec::new();
    for i in 0..50usize {
        let prio = Priority::new((i * 7 % 10) as u8).unwrap();
        client.publish(msg(&format!("m{i}"), prio)).await.unwrap();
        expected.push((prio.value(), i));
    }
    expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    let expected: Vec<String> = expected.into_iter().map(|(_, i)| format!("m{i}")).collect();

    broker.set_available(true);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.delivered_keys(), expected);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn burst_mode_collects_publishes_into_one_call() {
    let mut cfg = failsafe_config(-1, 100);
    cfg.address.burst_mode.collect_time_ms = 100;
    let (client, broker) = client_with(cfg, None);
    client.connect(ConnectQos::new("burst")).await.unwrap();

    for key in ["a", "b", "c"] {
        let ret = client.publish(msg(key, Priority::NORM)).await.unwrap();
        assert_eq!(ret.state, RequestState::Queued);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(broker.delivered().is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.batch_sizes(), vec![3]);
    assert_eq!(broker.delivered_keys(), vec!["a", "b", "c"]);

    let stamped: Vec<(i64, i64)> = broker
        .delivered()
        .iter()
        .map(|e| (e.qos().queue_index, e.qos().queue_size))
        .collect();
    assert_eq!(stamped, vec![(0, 3), (1, 3), (2, 3)]);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn burst_limit_caps_each_call() {
    let mut cfg = failsafe_config(-1, 100);
    cfg.address.burst_mode.collect_time_ms = 100;
    cfg.address.burst_mode.max_entries = 2;
    let (client, broker) = client_with(cfg, None);
    client.connect(ConnectQos::new("capped")).await.unwrap();

    for key in ["a", "b", "c", "d", "e"] {
        client.publish(msg(key, Priority::NORM)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(broker.batch_sizes(), vec![2, 2, 1]);
    assert_eq!(broker.delivered_keys(), vec!["a", "b", "c", "d", "e"]);
    let snap = client.metrics().snapshot();
    assert_eq!(snap.dispatched_batches, 3);
    assert_eq!(snap.dispatched_entries, 5);
    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_puts_drain_in_priority_then_id_order() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 250;

    let cfg = QueueConfig {
        max_entries: 10_000,
        on_overflow: OverflowPolicy::Exception,
        ..QueueConfig::default()
    };
    let queue = Arc::new(
        ClientQueue::new(
            cfg,
            Arc::new(DeadLetterQueue::new(1)),
            Arc::new(ClientMetrics::new()),
        )
        .unwrap(),
    );

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for n in 0..PER_PRODUCER {
                    let prio = Priority::new(((p * 3 + n) % 10) as u8).unwrap();
                    let unit = msg(&format!("p{p}-{n}"), prio);
                    queue
                        .put(QueueEntry::new(MethodName::Publish, unit))
                        .await
                        .unwrap();
                    if n % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();

    let mut delivered: Vec<QueueEntry> = Vec::new();
    while delivered.len() < PRODUCERS * PER_PRODUCER {
        let batch = queue.peek(Some(8), None);
        if batch.is_empty() {
            tokio::task::yield_now().await;
            continue;
        }
        assert!(batch.windows(2).all(|w| {
            w[0].priority() > w[1].priority()
                || (w[0].priority() == w[1].priority() && w[0].unique_id() < w[1].unique_id())
        }));
        assert_eq!(queue.remove(&batch), batch.len());
        delivered.extend(batch);
    }
    for producer in producers {
        producer.await.unwrap();
    }
    assert!(queue.is_empty());

    let ids: HashSet<u64> = delivered.iter().map(|e| e.unique_id()).collect();
    assert_eq!(ids.len(), delivered.len());

    // within a priority nothing older is served after something newer
    let mut last_id: HashMap<u8, u64> = HashMap::new();
    for e in &delivered {
        let prev = last_id.insert(e.priority().value(), e.unique_id());
        if let Some(prev) = prev {
            assert!(prev < e.unique_id(), "{} served out of order", e.key());
        }
    }

    // and each producer's entries of one priority arrive in put order
    let mut last_n: HashMap<(String, u8), usize> = HashMap::new();
    for e in &delivered {
        let (producer, n) = e.key().split_once('-').unwrap();
        let n: usize = n.parse().unwrap();
        let slot = (producer.to_string(), e.priority().value());
        if let Some(prev) = last_n.insert(slot, n) {
            assert!(prev < n);
        }
    }
}
