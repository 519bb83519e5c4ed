mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use blipmq_client::core::timer::TimerService;

#[tokio::test(start_paused = true)]
async fn timeouts_fire_in_deadline_order() {
    common::init_logging();
    let timer = TimerService::new("order");
    let (tx, rx) = flume::unbounded();
    let start = Instant::now();

    for (label, delay) in [("late", 90u64), ("early", 30), ("mid", 60)] {
        let tx = tx.clone();
        timer
            .register(
                delay,
                move |_| {
                    let _ = tx.send((label, Instant::now()));
                },
                None,
            )
            .unwrap();
    }

    let mut fired = Vec::new();
    for _ in 0..3 {
        fired.push(rx.recv_async().await.unwrap());
    }
    let labels: Vec<&str> = fired.iter().map(|(l, _)| *l).collect();
    assert_eq!(labels, vec!["early", "mid", "late"]);
    for ((_, at), delay) in fired.iter().zip([30u64, 60, 90]) {
        let elapsed = at.duration_since(start);
        assert!(elapsed >= Duration::from_millis(delay));
        assert!(elapsed <= Duration::from_millis(delay + 50));
    }
    timer.shutdown();
    timer.join().await;
}

#[tokio::test]
async fn timeouts_fire_on_the_wall_clock() {
    let timer = TimerService::new("wall");
    let (tx, rx) = flume::bounded(1);
    let start = Instant::now();
    let payload: Arc<dyn std::any::Any + Send + Sync> = Arc::new(42u32);
    timer
        .register(
            20,
            move |data| {
                let value = data
                    .and_then(|d| d.downcast_ref::<u32>().copied())
                    .unwrap_or_default();
                let _ = tx.send(value);
            },
            Some(payload),
        )
        .unwrap();

    let value = tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, 42);
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert!(timer.is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_drops_pending_timeouts() {
    let timer = TimerService::new("stop");
    let handle = timer.register(1_000, |_| panic!("must not fire"), None).unwrap();
    assert_eq!(timer.time_to_expiry(handle), Some(1_000));

    timer.shutdown();
    timer.join().await;
    assert!(timer.is_empty());
    assert!(timer.register(10, |_| {}, None).is_err());
}
