use std::sync::Arc;
use std::time::{Duration, Instant};

use manifest_cache_common::message::Message;
use manifest_cache_common::metrics::timing_guard;
use manifest_cache_common::queue::MAX_BLOCK_COUNT;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::metrics_consts::{BLOCKS_FLUSHED, BLOCK_FLUSH_TIME, MESSAGES_RECEIVED};
use crate::reconciler::BatchReconciler;

/// How often the throughput is logged, in messages.
const THROUGHPUT_LOG_INTERVAL: u64 = 1000;

/// The read side of the work channel, shared by all worker loops.
#[derive(Clone)]
pub struct SharedReceiver(Arc<Mutex<mpsc::Receiver<Message>>>);

pub enum Received {
    Message(Message),
    Timeout,
    Closed,
}

impl SharedReceiver {
    pub fn new(receiver: mpsc::Receiver<Message>) -> Self {
        Self(Arc::new(Mutex::new(receiver)))
    }

    /// Wait up to `wait` for the next message. Waiting for other workers to
    /// release the receiver counts against the same deadline.
    pub async fn recv_timeout(&self, wait: Duration) -> Received {
        let receive = async { self.0.lock().await.recv().await };
        match tokio::time::timeout(wait, receive).await {
            Ok(Some(message)) => Received::Message(message),
            Ok(None) => Received::Closed,
            Err(_) => Received::Timeout,
        }
    }
}

/// Collects messages into blocks and hands every block to a `BatchReconciler`.
///
/// A block is flushed as soon as it is full, or when no message arrived for
/// `wait_timeout` and something is pending.
pub struct Worker {
    id: usize,
    reconciler: BatchReconciler,
    wait_timeout: Duration,
    block_size: usize,
}

impl Worker {
    pub fn new(id: usize, reconciler: BatchReconciler, wait_timeout: Duration) -> Self {
        Self {
            id,
            reconciler,
            wait_timeout,
            block_size: MAX_BLOCK_COUNT,
        }
    }

    /// Run until the channel closes. Returns an error only for failures that
    /// must take the process down.
    pub async fn run(&self, inbound: SharedReceiver) -> Result<(), WorkerError> {
        let mut queued = Vec::with_capacity(self.block_size);
        let mut count: u64 = 0;
        let mut start = Instant::now();

        loop {
            match inbound.recv_timeout(self.wait_timeout).await {
                Received::Message(message) => {
                    count += 1;
                    metrics::counter!(MESSAGES_RECEIVED).increment(1);

                    queued.push(message);
                    if queued.len() == self.block_size {
                        self.flush(&mut queued, "full").await?;
                    }

                    if count % THROUGHPUT_LOG_INTERVAL == 0 {
                        info!(
                            worker = self.id,
                            "processed {count} messages ({:.2} tps)",
                            tps(count, start)
                        );
                    }
                }
                Received::Timeout => {
                    // quiet period, send anything pending
                    if !queued.is_empty() {
                        self.flush(&mut queued, "idle").await?;
                        info!(
                            worker = self.id,
                            "processed {count} messages ({:.2} tps) (flushing)",
                            tps(count, start)
                        );
                    }

                    count = 0;
                    start = Instant::now();
                }
                Received::Closed => {
                    if !queued.is_empty() {
                        self.flush(&mut queued, "shutdown").await?;
                    }
                    info!(worker = self.id, "inbound channel closed, stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn flush(
        &self,
        queued: &mut Vec<Message>,
        reason: &'static str,
    ) -> Result<(), WorkerError> {
        let block = std::mem::replace(queued, Vec::with_capacity(self.block_size));
        let size = block.len();

        let timer = timing_guard(BLOCK_FLUSH_TIME);
        let result = self.reconciler.reconcile(block).await;
        timer.fin();
        metrics::counter!(BLOCKS_FLUSHED, "reason" => reason).increment(1);

        match result {
            Ok(reconciliation) => {
                if reconciliation.is_partial() {
                    warn!(
                        worker = self.id,
                        "one or more operations unsuccessful, {} of {size} messages handed off",
                        reconciliation.delivered()
                    );
                }
                Ok(())
            }
            Err(error) => {
                error!(worker = self.id, "block of {size} messages failed: {error}");
                Err(WorkerError::Reconcile {
                    worker: self.id,
                    error,
                })
            }
        }
    }
}

fn tps(count: u64, start: Instant) -> f64 {
    let elapsed = start.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        count as f64 / elapsed
    } else {
        0.0
    }
}
