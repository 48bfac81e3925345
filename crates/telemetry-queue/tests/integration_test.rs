// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Server};
use std::sync::Arc;
use telemetry_queue::{
    circuit_breaker::CircuitState,
    store::{KeyValueStore, MemoryStore, SledStore},
    BatchScheduler, EnqueueOutcome, Entry, HttpTransport, QueueConfig, ReliabilityQueue,
    TickOutcome,
};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

fn http_transport(url: &str) -> Arc<HttpTransport> {
    Arc::new(HttpTransport::new(
        format!("{url}/api/client-errors"),
        Duration::from_secs(5),
        None,
    ))
}

#[tokio::test]
async fn queued_errors_reach_the_collector() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/client-errors")
        .match_header("Content-Type", "application/json")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#"^\[\{.*"message":"TypeError: x is undefined""#.to_string()),
            Matcher::Regex(r#""statusCode":500"#.to_string()),
        ]))
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let queue = ReliabilityQueue::new(QueueConfig::default(), Arc::new(MemoryStore::new()));
    let scheduler = BatchScheduler::new(queue.clone(), http_transport(&server.url()));

    let entry = Entry::error("TypeError: x is undefined")
        .with_request("https://app.example.com/checkout", Some(500));
    assert_eq!(queue.enqueue(entry.clone()), EnqueueOutcome::Accepted);
    assert_eq!(queue.enqueue(entry), EnqueueOutcome::Duplicate);

    let outcome = scheduler.tick().await;

    mock.assert_async().await;
    assert_eq!(outcome, TickOutcome::Delivered { count: 1, status: 202 });
    assert!(queue.is_empty());
}

#[tokio::test]
async fn pending_entries_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    {
        let backend: Arc<dyn KeyValueStore> = Arc::new(SledStore::open(&path).unwrap());
        let queue = ReliabilityQueue::new(QueueConfig::default(), backend);
        queue.enqueue(Entry::error("first"));
        queue.enqueue(Entry::error("second"));
    }

    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/client-errors")
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let backend: Arc<dyn KeyValueStore> = Arc::new(SledStore::open(&path).unwrap());
    let queue = ReliabilityQueue::new(QueueConfig::default(), backend);
    let messages: Vec<String> = queue.pending().into_iter().map(|e| e.message).collect();
    assert_eq!(messages, vec!["first", "second"]);

    let scheduler = BatchScheduler::new(queue.clone(), http_transport(&server.url()));
    assert_eq!(scheduler.flush().await, 2);

    mock.assert_async().await;
    assert!(queue.is_empty());
}

#[tokio::test]
async fn unreachable_collector_opens_the_breaker() {
    // Nothing listens on port 1.
    let transport = Arc::new(HttpTransport::new(
        "http://127.0.0.1:1/api/client-errors",
        Duration::from_secs(1),
        None,
    ));
    let queue = ReliabilityQueue::new(QueueConfig::default(), Arc::new(MemoryStore::new()));
    let scheduler = BatchScheduler::new(queue.clone(), transport);
    queue.enqueue(Entry::error("collector down"));

    for _ in 0..3 {
        assert_eq!(scheduler.tick().await, TickOutcome::Failed);
    }
    assert_eq!(scheduler.tick().await, TickOutcome::CircuitOpen);

    let stats = queue.stats();
    assert_eq!(stats.breaker.state, CircuitState::Open);
    assert_eq!(stats.failed_sends, 3);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn malformed_endpoint_keeps_entries_queued() {
    let transport = Arc::new(HttpTransport::new(
        "https://bad host/api/client-errors",
        Duration::from_secs(1),
        None,
    ));
    let queue = ReliabilityQueue::new(QueueConfig::default(), Arc::new(MemoryStore::new()));
    let scheduler = BatchScheduler::new(queue.clone(), transport);
    queue.enqueue(Entry::error("precious"));

    assert_eq!(scheduler.tick().await, TickOutcome::Failed);

    let stats = queue.stats();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.failed_sends, 1);
    assert_eq!(stats.breaker.consecutive_failures, 1);
    assert_eq!(queue.pending()[0].message, "precious");
}

#[tokio::test]
async fn collector_rejection_does_not_trip_the_breaker() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/client-errors")
        .with_status(500)
        .create_async()
        .await;

    let queue = ReliabilityQueue::new(QueueConfig::default(), Arc::new(MemoryStore::new()));
    let scheduler = BatchScheduler::new(queue.clone(), http_transport(&server.url()));

    for i in 0..5 {
        queue.enqueue(Entry::error(format!("error {i}")));
        scheduler.tick().await;
    }

    let stats = queue.stats();
    assert_eq!(stats.breaker.state, CircuitState::Closed);
    assert_eq!(stats.delivered, 5);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn running_scheduler_ships_and_flushes_on_shutdown() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/client-errors")
        .with_status(202)
        .expect(2)
        .create_async()
        .await;

    let config = QueueConfig {
        batch_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let queue = ReliabilityQueue::new(config, Arc::new(MemoryStore::new()));
    let scheduler = BatchScheduler::new(queue.clone(), http_transport(&server.url()));
    let cancel_token = CancellationToken::new();
    let handle = tokio::spawn(scheduler.run(cancel_token.clone()));

    queue.enqueue(Entry::error("while running"));
    sleep(Duration::from_millis(300)).await;
    assert!(queue.is_empty());

    queue.enqueue(Entry::error("at shutdown"));
    cancel_token.cancel();
    handle.await.unwrap();

    mock.assert_async().await;
    assert!(queue.is_empty());
}
