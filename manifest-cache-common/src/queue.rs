//! Batched message queue operations.
//!
//! Batch calls report one status per submitted message. A call where only some
//! items failed is not an error: the returned `BatchOutcome` is partial and the
//! caller decides what to do per message. An `Err` means the call as a whole
//! failed and nothing can be said about individual messages.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::blob::BlobError;
use crate::message::Message;

/// Most messages a single batch call may carry. Fixed by the queue service.
pub const MAX_BLOCK_COUNT: usize = 10;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue {0} does not exist")]
    QueueNotFound(String),
    #[error("batch of {0} messages exceeds the maximum of {MAX_BLOCK_COUNT}")]
    BatchTooLarge(usize),
    #[error("queue operation failed: {0}")]
    OperationFailed(String),
    #[error("malformed message received: {0}")]
    MalformedMessage(String),
    #[error("oversized payload storage failed: {0}")]
    PayloadStorage(#[from] BlobError),
}

/// Opaque reference to a resolved queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueHandle(String);

impl QueueHandle {
    pub fn new(handle: &str) -> Self {
        Self(handle.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Per-message result of a batch call, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    statuses: Vec<bool>,
}

impl BatchOutcome {
    pub fn new(statuses: Vec<bool>) -> Self {
        Self { statuses }
    }

    pub fn all_succeeded(count: usize) -> Self {
        Self::new(vec![true; count])
    }

    pub fn statuses(&self) -> &[bool] {
        &self.statuses
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.statuses.iter().filter(|ok| !**ok).count()
    }

    /// One or more operations in the batch were unsuccessful.
    pub fn is_partial(&self) -> bool {
        self.failed_count() > 0
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn queue_handle(&self, name: &str) -> Result<QueueHandle, QueueError>;

    /// Wait up to `wait` for messages, returning at most `MAX_BLOCK_COUNT` of them.
    async fn receive(&self, queue: &QueueHandle, wait: Duration)
        -> Result<Vec<Message>, QueueError>;

    async fn batch_put(
        &self,
        queue: &QueueHandle,
        messages: &[Message],
    ) -> Result<BatchOutcome, QueueError>;

    /// Delete messages previously received from `queue`.
    async fn batch_delete(
        &self,
        queue: &QueueHandle,
        messages: &[Message],
    ) -> Result<BatchOutcome, QueueError>;
}

pub(crate) fn check_block_size(messages: &[Message]) -> Result<(), QueueError> {
    if messages.len() > MAX_BLOCK_COUNT {
        return Err(QueueError::BatchTooLarge(messages.len()));
    }
    Ok(())
}

/// A recorded batch call against `MockQueue`.
#[derive(Debug)]
pub struct BatchCall {
    pub queue: QueueHandle,
    pub messages: Vec<Message>,
}

impl BatchCall {
    pub fn record_ids(&self) -> Vec<Option<&str>> {
        self.messages.iter().map(Message::record_id).collect()
    }
}

#[derive(Default)]
struct MockState {
    pending: HashMap<String, VecDeque<Message>>,
    puts: Vec<BatchCall>,
    deletes: Vec<BatchCall>,
    failing_puts: HashSet<usize>,
    failing_deletes: HashSet<usize>,
    fatal_put: bool,
    fatal_delete: bool,
    next_receipt: usize,
}

/// In-memory queue for tests. Clones share state.
///
/// Put and delete calls are recorded. Failures can be injected either per
/// position inside a batch (partial outcome) or for the whole call.
#[derive(Clone, Default)]
pub struct MockQueue {
    state: Arc<Mutex<MockState>>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the item at `position` of every put call fail.
    pub fn fail_put_at(self, position: usize) -> Self {
        self.state.lock().unwrap().failing_puts.insert(position);
        self
    }

    /// Make the item at `position` of every delete call fail.
    pub fn fail_delete_at(self, position: usize) -> Self {
        self.state.lock().unwrap().failing_deletes.insert(position);
        self
    }

    /// Make every put call fail as a whole.
    pub fn fail_puts(self) -> Self {
        self.state.lock().unwrap().fatal_put = true;
        self
    }

    /// Make every delete call fail as a whole.
    pub fn fail_deletes(self) -> Self {
        self.state.lock().unwrap().fatal_delete = true;
        self
    }

    /// Make a message available for `receive` on `queue`.
    pub fn push(&self, queue: &str, message: Message) {
        self.state
            .lock()
            .unwrap()
            .pending
            .entry(queue.to_owned())
            .or_default()
            .push_back(message);
    }

    pub fn put_calls(&self) -> Vec<BatchCall> {
        snapshot(&self.state.lock().unwrap().puts)
    }

    pub fn delete_calls(&self) -> Vec<BatchCall> {
        snapshot(&self.state.lock().unwrap().deletes)
    }
}

fn snapshot(calls: &[BatchCall]) -> Vec<BatchCall> {
    calls
        .iter()
        .map(|call| BatchCall {
            queue: call.queue.clone(),
            messages: call.messages.iter().map(copy_message).collect(),
        })
        .collect()
}

fn copy_message(message: &Message) -> Message {
    let copy = message.content_clone();
    match message.receipt_handle() {
        Some(receipt) => copy.with_receipt_handle(receipt),
        None => copy,
    }
}

fn outcome(size: usize, failing: &HashSet<usize>) -> BatchOutcome {
    BatchOutcome::new((0..size).map(|ix| !failing.contains(&ix)).collect())
}

#[async_trait]
impl MessageQueue for MockQueue {
    async fn queue_handle(&self, name: &str) -> Result<QueueHandle, QueueError> {
        Ok(QueueHandle::new(name))
    }

    async fn receive(
        &self,
        queue: &QueueHandle,
        wait: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        let received: Vec<Message> = {
            let mut state = self.state.lock().unwrap();
            let mut received = Vec::new();
            while received.len() < MAX_BLOCK_COUNT {
                let Some(message) = state
                    .pending
                    .get_mut(queue.as_str())
                    .and_then(VecDeque::pop_front)
                else {
                    break;
                };
                state.next_receipt += 1;
                let receipt = format!("receipt-{}", state.next_receipt);
                received.push(message.with_receipt_handle(&receipt));
            }
            received
        };

        if received.is_empty() {
            tokio::time::sleep(wait).await;
        }
        Ok(received)
    }

    async fn batch_put(
        &self,
        queue: &QueueHandle,
        messages: &[Message],
    ) -> Result<BatchOutcome, QueueError> {
        check_block_size(messages)?;
        let mut state = self.state.lock().unwrap();
        if state.fatal_put {
            return Err(QueueError::OperationFailed("injected put failure".to_owned()));
        }
        state.puts.push(BatchCall {
            queue: queue.clone(),
            messages: messages.iter().map(copy_message).collect(),
        });
        Ok(outcome(messages.len(), &state.failing_puts))
    }

    async fn batch_delete(
        &self,
        queue: &QueueHandle,
        messages: &[Message],
    ) -> Result<BatchOutcome, QueueError> {
        check_block_size(messages)?;
        let mut state = self.state.lock().unwrap();
        if state.fatal_delete {
            return Err(QueueError::OperationFailed(
                "injected delete failure".to_owned(),
            ));
        }
        state.deletes.push(BatchCall {
            queue: queue.clone(),
            messages: messages.iter().map(copy_message).collect(),
        });
        let injected = outcome(messages.len(), &state.failing_deletes);
        let statuses = messages
            .iter()
            .zip(injected.statuses())
            .map(|(message, ok)| *ok && message.receipt_handle().is_some())
            .collect();
        Ok(BatchOutcome::new(statuses))
    }
}
