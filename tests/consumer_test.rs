//! Integration tests for the consumer loop: delete, retry and abort.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use queuelite::consumer::Consumer;
use queuelite::model::{Delivery, Disposition, Outcome};
use queuelite::storage::{Storage, StorageOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    val: i32,
}

async fn open_consumer(dir: &TempDir, consumer_id: &str) -> Consumer {
    let storage = Storage::open(dir.path(), consumer_id, StorageOptions::default())
        .await
        .expect("failed to open storage");
    Consumer::new(Arc::new(storage))
}

async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

// ---------------------------------------------------------------------------
// Single claims via process_next
// ---------------------------------------------------------------------------

#[tokio::test]
async fn success_deletes_message_after_one_delivery() {
    let dir = TempDir::new().unwrap();
    let consumer = open_consumer(&dir, "c1").await;
    let id = consumer.storage().enqueue(&Job { val: 1 }, Some(5)).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut handler = {
        let seen = Arc::clone(&seen);
        move |job: Job, delivery: Delivery| {
            seen.lock().unwrap().push((job, delivery.attempt_count));
            async { Outcome::Success }
        }
    };

    let disposition = within(consumer.process_next(&mut handler)).await.unwrap();

    assert_eq!(disposition, Disposition::Completed { id, attempts: 1 });
    assert_eq!(*seen.lock().unwrap(), vec![(Job { val: 1 }, 0)]);
    let stats = consumer.storage().stats().await.unwrap();
    assert_eq!((stats.pending, stats.working, stats.aborted), (0, 0, 0));
    assert!(consumer.storage().try_claim().await.unwrap().is_none());
}

#[tokio::test]
async fn failures_retry_with_increasing_attempt_count() {
    let dir = TempDir::new().unwrap();
    let consumer = open_consumer(&dir, "c1").await;
    let id = consumer.storage().enqueue(&Job { val: 1 }, Some(5)).await.unwrap();

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let mut handler = {
        let attempts = Arc::clone(&attempts);
        move |_job: Job, delivery: Delivery| {
            attempts.lock().unwrap().push(delivery.attempt_count);
            assert_eq!(delivery.message_id, id);
            async move {
                if delivery.attempt_count < 3 {
                    Outcome::Retry("not yet".to_string())
                } else {
                    Outcome::Success
                }
            }
        }
    };

    let disposition = within(consumer.process_next(&mut handler)).await.unwrap();

    assert_eq!(disposition, Disposition::Completed { id, attempts: 4 });
    assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2, 3]);
    assert!(consumer.storage().list_working().await.unwrap().is_empty());
}

#[tokio::test]
async fn result_errors_count_as_retries() {
    let dir = TempDir::new().unwrap();
    let consumer = open_consumer(&dir, "c1").await;
    consumer.storage().enqueue(&Job { val: 1 }, Some(5)).await.unwrap();

    let mut handler = |_job: Job, delivery: Delivery| async move {
        let result: Result<(), String> = if delivery.attempt_count == 0 {
            Err("transient".to_string())
        } else {
            Ok(())
        };
        Outcome::from(result)
    };

    let disposition = within(consumer.process_next(&mut handler)).await.unwrap();
    assert!(matches!(disposition, Disposition::Completed { attempts: 2, .. }));
}

#[tokio::test]
async fn abort_moves_message_out_of_the_retry_cycle() {
    let dir = TempDir::new().unwrap();
    let consumer = open_consumer(&dir, "c1").await;
    let id = consumer.storage().enqueue(&Job { val: 1 }, Some(5)).await.unwrap();

    let calls = Arc::new(Mutex::new(0));
    let mut handler = {
        let calls = Arc::clone(&calls);
        move |_job: Job, _delivery: Delivery| {
            *calls.lock().unwrap() += 1;
            async { Outcome::Abort("poisoned".to_string()) }
        }
    };

    let disposition = within(consumer.process_next(&mut handler)).await.unwrap();

    assert_eq!(disposition, Disposition::Aborted { id, attempts: 1 });
    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(consumer.storage().list_aborted().await.unwrap(), vec![id]);
    assert!(consumer.storage().list_working().await.unwrap().is_empty());

    // A restart of the same consumer identity does not bring it back.
    drop(consumer);
    let restarted = open_consumer(&dir, "c1").await;
    assert!(restarted.storage().recover_in_flight().await.unwrap().is_empty());
    assert!(restarted.storage().try_claim().await.unwrap().is_none());
    assert_eq!(restarted.storage().list_aborted().await.unwrap(), vec![id]);
}

#[tokio::test]
async fn undecodable_body_is_aborted_without_calling_handler() {
    let dir = TempDir::new().unwrap();
    let consumer = open_consumer(&dir, "c1").await;
    let id = consumer
        .storage()
        .enqueue(&json!({"unexpected": true}), Some(5))
        .await
        .unwrap();

    let called = Arc::new(Mutex::new(false));
    let mut handler = {
        let called = Arc::clone(&called);
        move |_job: Job, _delivery: Delivery| {
            *called.lock().unwrap() = true;
            async { Outcome::Success }
        }
    };

    let disposition = within(consumer.process_next(&mut handler)).await.unwrap();

    assert_eq!(disposition, Disposition::Aborted { id, attempts: 0 });
    assert!(!*called.lock().unwrap());
    assert_eq!(consumer.storage().list_aborted().await.unwrap(), vec![id]);
}

// ---------------------------------------------------------------------------
// The run loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_consumes_in_priority_then_arrival_order() {
    let dir = TempDir::new().unwrap();
    let consumer = open_consumer(&dir, "c1").await;
    let storage = Arc::clone(consumer.storage());
    storage.enqueue(&Job { val: 3 }, Some(1)).await.unwrap();
    storage.enqueue(&Job { val: 1 }, Some(5)).await.unwrap();
    storage.enqueue(&Job { val: 2 }, Some(1)).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let order = Arc::clone(&order);
        let ctrl = consumer.clone();
        move |job: Job, _delivery: Delivery| {
            let mut order = order.lock().unwrap();
            order.push(job.val);
            if order.len() == 3 {
                ctrl.shutdown();
            }
            async { Outcome::Success }
        }
    };

    within(consumer.run(handler)).await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
    assert!(storage.list_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn run_picks_up_messages_published_while_idle() {
    let dir = TempDir::new().unwrap();
    let consumer = open_consumer(&dir, "c1").await;
    let producer = Storage::open(dir.path(), "producer", StorageOptions::default())
        .await
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let received = Arc::clone(&received);
        let ctrl = consumer.clone();
        move |body: Value, _delivery: Delivery| {
            received.lock().unwrap().push(body);
            ctrl.shutdown();
            async { Outcome::Success }
        }
    };

    let running = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(handler).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    producer.enqueue(&json!({"val": 1}), Some(5)).await.unwrap();

    within(running).await.unwrap().unwrap();
    assert_eq!(*received.lock().unwrap(), vec![json!({"val": 1})]);
}

#[tokio::test]
async fn abort_then_continue_with_next_message() {
    let dir = TempDir::new().unwrap();
    let consumer = open_consumer(&dir, "c1").await;
    let storage = Arc::clone(consumer.storage());
    let first = storage.enqueue(&Job { val: 1 }, Some(5)).await.unwrap();
    storage.enqueue(&Job { val: 2 }, Some(5)).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        let ctrl = consumer.clone();
        move |job: Job, _delivery: Delivery| {
            seen.lock().unwrap().push(job.val);
            let outcome = if job.val == 1 {
                Outcome::Abort("bad job".to_string())
            } else {
                ctrl.shutdown();
                Outcome::Success
            };
            async move { outcome }
        }
    };

    within(consumer.run(handler)).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(storage.list_aborted().await.unwrap(), vec![first]);
}

#[tokio::test]
async fn shutdown_while_idle_stops_the_loop() {
    let dir = TempDir::new().unwrap();
    let consumer = open_consumer(&dir, "c1").await;

    let running = tokio::spawn({
        let consumer = consumer.clone();
        async move {
            consumer
                .run(|_body: Value, _delivery: Delivery| async { Outcome::Success })
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    consumer.shutdown();

    within(running).await.unwrap().unwrap();
    assert!(consumer.is_stopping());
}

#[tokio::test]
async fn shutdown_between_retries_returns_message_to_pending() {
    let dir = TempDir::new().unwrap();
    let consumer = open_consumer(&dir, "c1").await;
    let id = consumer.storage().enqueue(&Job { val: 1 }, Some(5)).await.unwrap();

    let handler = {
        let ctrl = consumer.clone();
        move |_job: Job, delivery: Delivery| {
            if delivery.attempt_count == 2 {
                ctrl.shutdown();
            }
            async { Outcome::Retry("always failing".to_string()) }
        }
    };

    within(consumer.run(handler)).await.unwrap();

    assert_eq!(consumer.storage().list_pending().await.unwrap(), vec![id]);
    assert!(consumer.storage().list_working().await.unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_on_stops_the_loop_when_the_signal_fires() {
    let dir = TempDir::new().unwrap();
    let consumer = open_consumer(&dir, "c1").await;
    let id = consumer.storage().enqueue(&Job { val: 1 }, None).await.unwrap();

    let (fire, signal) = tokio::sync::oneshot::channel::<()>();
    consumer.shutdown_on(signal);

    let mut fire = Some(fire);
    let handler = move |_job: Job, _delivery: Delivery| {
        if let Some(fire) = fire.take() {
            fire.send(()).unwrap();
        }
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Outcome::Retry("still failing".to_string())
        }
    };

    within(consumer.run(handler)).await.unwrap();

    assert!(consumer.is_stopping());
    assert_eq!(consumer.storage().list_pending().await.unwrap(), vec![id]);
    assert!(consumer.storage().list_working().await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restart_redelivers_unacked_claim_with_fresh_attempt_count() {
    let dir = TempDir::new().unwrap();

    // First process claims, then "dies" without acking.
    let crashed = open_consumer(&dir, "c1").await;
    let id = crashed.storage().enqueue(&Job { val: 1 }, Some(5)).await.unwrap();
    assert_eq!(crashed.storage().try_claim().await.unwrap(), Some(id));
    drop(crashed);

    assert!(dir.path().join("working").join("c1").join(id.to_string()).exists());

    // Second process, same identity.
    let restarted = open_consumer(&dir, "c1").await;
    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let deliveries = Arc::clone(&deliveries);
        let ctrl = restarted.clone();
        move |job: Job, delivery: Delivery| {
            deliveries
                .lock()
                .unwrap()
                .push((job.val, delivery.message_id, delivery.attempt_count));
            ctrl.shutdown();
            async { Outcome::Success }
        }
    };

    within(restarted.run(handler)).await.unwrap();

    assert_eq!(*deliveries.lock().unwrap(), vec![(1, id, 0)]);
    assert!(restarted.storage().list_working().await.unwrap().is_empty());
}

#[tokio::test]
async fn close_releases_working_dir() {
    let dir = TempDir::new().unwrap();
    let consumer = open_consumer(&dir, "c1").await;
    let id = consumer.storage().enqueue(&Job { val: 1 }, Some(5)).await.unwrap();
    consumer.storage().try_claim().await.unwrap();

    consumer.close().await.unwrap();

    assert!(consumer.is_stopping());
    assert!(!dir.path().join("working").join("c1").exists());
    assert_eq!(consumer.storage().list_pending().await.unwrap(), vec![id]);
}
