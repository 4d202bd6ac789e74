use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use manifest_cache_common::blob::MockBlobStore;
use manifest_cache_common::fetch::MockFetcher;
use manifest_cache_common::message::Message;
use manifest_cache_common::queue::{MockQueue, QueueHandle, MAX_BLOCK_COUNT};
use manifest_cache_worker::config::CachePolicy;
use manifest_cache_worker::error::WorkerError;
use manifest_cache_worker::poller::QueuePoller;
use manifest_cache_worker::reconciler::BatchReconciler;
use manifest_cache_worker::rewriter::DocumentRewriter;
use manifest_cache_worker::worker::{SharedReceiver, Worker};
use tokio::sync::mpsc;

const MANIFEST_URL: &str = "https://iiif.example.org/pid/uva-lib:2513/manifest";

fn message(ix: usize) -> Message {
    let id = format!("u{ix}");
    Message::new(format!(
        "<add><doc><field name=\"id\">{id}</field>\
         <field name=\"url_iiif_manifest_stored\">{MANIFEST_URL}</field></doc></add>"
    ))
    .with_attribute("id", &id)
    .with_receipt_handle(&format!("receipt-{ix}"))
}

fn worker(id: usize, queue: &MockQueue, wait_timeout: Duration) -> Worker {
    let fetcher = MockFetcher::new().with_body(MANIFEST_URL, b"{\"label\": \"2513\"}");
    let rewriter = DocumentRewriter::new(
        Arc::new(fetcher),
        Arc::new(MockBlobStore::new()),
        "manifests",
    );
    let reconciler = BatchReconciler::new(
        rewriter,
        Arc::new(queue.clone()),
        QueueHandle::new("inbound"),
        QueueHandle::new("outbound"),
        CachePolicy::BestEffort,
    );
    Worker::new(id, reconciler, wait_timeout)
}

async fn assert_or_retry<F>(check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check())
}

fn published_ids(queue: &MockQueue) -> Vec<String> {
    queue
        .put_calls()
        .iter()
        .flat_map(|call| {
            call.record_ids()
                .into_iter()
                .flatten()
                .map(str::to_owned)
                .collect::<Vec<_>>()
        })
        .collect()
}

#[tokio::test]
async fn test_full_block_flushes_without_waiting() {
    let queue = MockQueue::new();
    let (sender, receiver) = mpsc::channel(100);
    let worker = worker(1, &queue, Duration::from_secs(3600));
    let handle = tokio::spawn(async move { worker.run(SharedReceiver::new(receiver)).await });

    for ix in 0..MAX_BLOCK_COUNT {
        sender.send(message(ix)).await.unwrap();
    }

    assert_or_retry(|| queue.delete_calls().len() == 1).await;
    assert_eq!(queue.put_calls()[0].messages.len(), MAX_BLOCK_COUNT);
    assert_eq!(queue.delete_calls()[0].messages.len(), MAX_BLOCK_COUNT);

    drop(sender);
    handle.await.unwrap().expect("worker failed");
    assert_eq!(queue.put_calls().len(), 1);
}

#[tokio::test]
async fn test_partial_block_flushes_once_when_idle() {
    let queue = MockQueue::new();
    let (sender, receiver) = mpsc::channel(100);
    let worker = worker(1, &queue, Duration::from_millis(50));
    let handle = tokio::spawn(async move { worker.run(SharedReceiver::new(receiver)).await });

    for ix in 0..3 {
        sender.send(message(ix)).await.unwrap();
    }

    assert_or_retry(|| queue.delete_calls().len() == 1).await;
    // several idle periods pass without anything new to send
    tokio::time::sleep(Duration::from_millis(300)).await;

    let puts = queue.put_calls();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].record_ids(), vec![Some("u0"), Some("u1"), Some("u2")]);
    assert_eq!(queue.delete_calls().len(), 1);

    drop(sender);
    handle.await.unwrap().expect("worker failed");
    assert_eq!(queue.put_calls().len(), 1);
}

#[tokio::test]
async fn test_pending_block_flushed_on_shutdown() {
    let queue = MockQueue::new();
    let (sender, receiver) = mpsc::channel(100);
    let worker = worker(1, &queue, Duration::from_secs(3600));
    let handle = tokio::spawn(async move { worker.run(SharedReceiver::new(receiver)).await });

    sender.send(message(0)).await.unwrap();
    sender.send(message(1)).await.unwrap();
    drop(sender);

    handle.await.unwrap().expect("worker failed");
    let puts = queue.put_calls();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].messages.len(), 2);
}

#[tokio::test]
async fn test_fatal_queue_error_stops_the_worker() {
    let queue = MockQueue::new().fail_puts();
    let (sender, receiver) = mpsc::channel(100);
    let worker = worker(7, &queue, Duration::from_secs(3600));
    let handle = tokio::spawn(async move { worker.run(SharedReceiver::new(receiver)).await });

    for ix in 0..MAX_BLOCK_COUNT {
        sender.send(message(ix)).await.unwrap();
    }

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert!(matches!(result, Err(WorkerError::Reconcile { worker: 7, .. })));
    assert!(queue.delete_calls().is_empty());
}

#[tokio::test]
async fn test_partial_failure_keeps_the_worker_running() {
    let queue = MockQueue::new().fail_put_at(0);
    let (sender, receiver) = mpsc::channel(100);
    let worker = worker(1, &queue, Duration::from_secs(3600));
    let handle = tokio::spawn(async move { worker.run(SharedReceiver::new(receiver)).await });

    for ix in 0..2 * MAX_BLOCK_COUNT {
        sender.send(message(ix)).await.unwrap();
    }

    assert_or_retry(|| queue.delete_calls().len() == 2).await;
    for call in queue.delete_calls() {
        assert_eq!(call.messages.len(), MAX_BLOCK_COUNT - 1);
    }

    drop(sender);
    handle.await.unwrap().expect("worker failed");
}

#[tokio::test]
async fn test_workers_share_the_channel() {
    let queue = MockQueue::new();
    let (sender, receiver) = mpsc::channel(100);
    let receiver = SharedReceiver::new(receiver);

    let mut handles = Vec::new();
    for id in 1..=3 {
        let worker = worker(id, &queue, Duration::from_millis(50));
        let receiver = receiver.clone();
        handles.push(tokio::spawn(async move { worker.run(receiver).await }));
    }
    drop(receiver);

    let total = 25;
    for ix in 0..total {
        sender.send(message(ix)).await.unwrap();
    }

    assert_or_retry(|| published_ids(&queue).len() == total).await;
    let unique: HashSet<String> = published_ids(&queue).into_iter().collect();
    assert_eq!(unique.len(), total);

    drop(sender);
    for handle in handles {
        handle.await.unwrap().expect("worker failed");
    }
}

#[tokio::test]
async fn test_poller_feeds_workers_end_to_end() {
    let queue = MockQueue::new();
    for ix in 0..12 {
        queue.push("inbound", message(ix));
    }

    let (sender, receiver) = mpsc::channel(4);
    let poller = QueuePoller::new(
        Arc::new(queue.clone()),
        QueueHandle::new("inbound"),
        Duration::from_millis(20),
    );
    let poller_handle = tokio::spawn(async move { poller.run(sender).await });

    let worker = worker(1, &queue, Duration::from_millis(200));
    let receiver = SharedReceiver::new(receiver);
    let worker_handle = tokio::spawn({
        let receiver = receiver.clone();
        async move { worker.run(receiver).await }
    });

    let deleted = || -> usize {
        queue
            .delete_calls()
            .iter()
            .map(|call| call.messages.len())
            .sum()
    };
    assert_or_retry(|| deleted() == 12).await;

    let puts = queue.put_calls();
    assert_eq!(puts.len(), 2);
    assert_eq!(puts[0].messages.len(), MAX_BLOCK_COUNT);
    assert_eq!(puts[1].messages.len(), 2);
    for call in &puts {
        for message in &call.messages {
            let payload = std::str::from_utf8(&message.payload).unwrap();
            assert!(payload
                .contains(">https://manifests.s3.amazonaws.com/pid-uva-lib-2513-manifest<"));
        }
    }
    // receipts issued by the inbound queue come back on delete
    for call in queue.delete_calls() {
        assert!(call.messages.iter().all(|m| m.receipt_handle().is_some()));
    }

    worker_handle.abort();
    drop(receiver);
    let result = tokio::time::timeout(Duration::from_secs(5), poller_handle)
        .await
        .expect("poller did not stop")
        .unwrap();
    assert!(result.is_ok());
}
