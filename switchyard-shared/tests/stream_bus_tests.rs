/// Integration tests for the stream bus consumer-group protocol
///
/// Run with: cargo test --test stream_bus_tests -- --ignored

mod common;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard_shared::redis::stream_receiver::{processor_fn, ReceiverOptions, StartFrom, StreamMessage};
use switchyard_shared::redis::{LazyRedis, StreamBus, StreamConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SessionClosed {
    session_id: u32,
}

fn bus(label: &str) -> StreamBus {
    let mut config = StreamConfig::new(common::unique(label));
    config.block_ms = 20;
    config.claim_idle_ms = 100;
    StreamBus::new(LazyRedis::new(common::test_redis_config()), config)
}

async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_group_members_share_the_work() {
    let bus = bus("share");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for consumer in ["a", "b"] {
        let sink = seen.clone();
        let handle = bus
            .create_receiver(
                ReceiverOptions::new("billing").consumer_id(consumer),
                processor_fn(move |msg: StreamMessage<SessionClosed>| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(msg.payload.session_id);
                        Ok::<(), anyhow::Error>(())
                    }
                }),
            )
            .await
            .unwrap();
        handles.push(handle);
    }

    for session_id in 0..20 {
        bus.send(&SessionClosed { session_id }).await.unwrap();
    }

    assert!(wait_for(|| seen.lock().unwrap().len() >= 20).await);
    let unique: HashSet<u32> = seen.lock().unwrap().iter().copied().collect();
    assert_eq!(unique.len(), 20);

    for handle in handles {
        handle.abort();
        handle.stopped().await;
    }
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_each_group_gets_every_message() {
    let bus = bus("fanout");
    let billing = Arc::new(Mutex::new(0u32));
    let audit = Arc::new(Mutex::new(0u32));

    let mut handles = Vec::new();
    for (group, counter) in [("billing", billing.clone()), ("audit", audit.clone())] {
        let handle = bus
            .create_receiver(
                ReceiverOptions::new(group),
                processor_fn(move |_: StreamMessage<SessionClosed>| {
                    let counter = counter.clone();
                    async move {
                        *counter.lock().unwrap() += 1;
                        Ok::<(), anyhow::Error>(())
                    }
                }),
            )
            .await
            .unwrap();
        handles.push(handle);
    }

    for session_id in 0..5 {
        bus.send(&SessionClosed { session_id }).await.unwrap();
    }

    assert!(wait_for(|| *billing.lock().unwrap() == 5 && *audit.lock().unwrap() == 5).await);

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_failed_message_is_claimed_by_another_consumer() {
    let bus = bus("claim");
    bus.send(&SessionClosed { session_id: 1 }).await.unwrap();

    // First consumer never acknowledges
    let failing = bus
        .create_receiver(
            ReceiverOptions::new("billing")
                .consumer_id("flaky")
                .start_from(StartFrom::Beginning),
            processor_fn(|_: StreamMessage<SessionClosed>| async {
                Err::<(), _>(anyhow::anyhow!("database unavailable"))
            }),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    failing.abort();
    failing.stopped().await;

    let recovered = Arc::new(Mutex::new(Vec::new()));
    let sink = recovered.clone();
    let healthy = bus
        .create_receiver(
            ReceiverOptions::new("billing").consumer_id("healthy"),
            processor_fn(move |msg: StreamMessage<SessionClosed>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(msg.payload.session_id);
                    Ok::<(), anyhow::Error>(())
                }
            }),
        )
        .await
        .unwrap();

    assert!(wait_for(|| recovered.lock().unwrap().contains(&1)).await);
    healthy.abort();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_new_group_receives_messages_sent_before_it_existed() {
    let bus = bus("backlog");
    bus.send(&SessionClosed { session_id: 7 }).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = bus
        .create_receiver(
            ReceiverOptions::new("g"),
            processor_fn(move |msg: StreamMessage<SessionClosed>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(msg.payload.session_id);
                    Ok::<(), anyhow::Error>(())
                }
            }),
        )
        .await
        .unwrap();

    assert!(wait_for(|| !seen.lock().unwrap().is_empty()).await);
    // A second delivery would land here if the entry were left unacknowledged
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*seen.lock().unwrap(), vec![7]);

    handle.abort();
    handle.stopped().await;
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_latest_group_skips_earlier_messages() {
    let bus = bus("latest");
    bus.send(&SessionClosed { session_id: 1 }).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = bus
        .create_receiver(
            ReceiverOptions::new("g").start_from(StartFrom::Latest),
            processor_fn(move |msg: StreamMessage<SessionClosed>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(msg.payload.session_id);
                    Ok::<(), anyhow::Error>(())
                }
            }),
        )
        .await
        .unwrap();

    bus.send(&SessionClosed { session_id: 2 }).await.unwrap();

    assert!(wait_for(|| !seen.lock().unwrap().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*seen.lock().unwrap(), vec![2]);

    handle.abort();
    handle.stopped().await;
}
