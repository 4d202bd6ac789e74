use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::types::{
    DeleteMessageBatchRequestEntry, Message as SqsMessage, MessageAttributeValue,
    SendMessageBatchRequestEntry,
};
use aws_sdk_sqs::Client as AwsSqsSdkClient;
use bytes::Bytes;
use tracing::{error, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::message::{Message, Provenance};
use crate::queue::{
    check_block_size, BatchOutcome, MessageQueue, QueueError, QueueHandle, MAX_BLOCK_COUNT,
};

/// Attribute naming the bucket object that holds an oversized payload.
pub const OVERSIZE_ATTRIBUTE: &str = "oversize-key";

/// Payloads above this are kept in the message bucket instead of the queue.
/// The service limit is 256 KiB including attributes, so leave some room.
pub const MAX_INLINE_PAYLOAD_BYTES: usize = 240 * 1024;

/// Service limit for the sum of all entries of one `SendMessageBatch` call.
pub const MAX_BATCH_BYTES: usize = 256 * 1024;

/// Room kept for every entry whatever its payload: the pointer body and the
/// oversize attribute of a spilled entry fit well inside it.
const ENTRY_OVERHEAD_BYTES: usize = 1024;

/// Longest long-poll wait the queue service accepts.
const MAX_WAIT_SECONDS: u64 = 20;

/// Decide, per message, whether its payload goes to the message bucket.
///
/// Oversized messages and payloads above the inline limit always do. The rest
/// stay inline in batch order for as long as the whole request stays under
/// `MAX_BATCH_BYTES`.
pub fn spill_plan(messages: &[Message]) -> Vec<bool> {
    let mut total: usize = messages
        .iter()
        .map(|message| ENTRY_OVERHEAD_BYTES + attributes_size(message))
        .sum();

    messages
        .iter()
        .map(|message| {
            let size = message.payload.len();
            if message.provenance().is_oversized()
                || size > MAX_INLINE_PAYLOAD_BYTES
                || total + size > MAX_BATCH_BYTES
            {
                return true;
            }
            total += size;
            false
        })
        .collect()
}

fn attributes_size(message: &Message) -> usize {
    message
        .attributes
        .iter()
        .map(|(name, value)| name.len() + value.len() + "String".len())
        .sum()
}

/// Keeps payloads that do not fit in the queue in the message bucket.
struct OversizePayloads {
    blobs: Arc<dyn BlobStore>,
    bucket: String,
}

impl OversizePayloads {
    /// Turn a received queue message into a `Message`, fetching the payload
    /// from the bucket when the queue only carries a pointer.
    async fn decode(&self, received: &SqsMessage) -> Result<Message, QueueError> {
        let receipt = received
            .receipt_handle()
            .ok_or_else(|| QueueError::MalformedMessage("missing receipt handle".to_owned()))?;

        let mut attributes: HashMap<String, String> = received
            .message_attributes()
            .map(|attributes| {
                attributes
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .string_value()
                            .map(|value| (name.clone(), value.to_owned()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let (payload, provenance) = match attributes.remove(OVERSIZE_ATTRIBUTE) {
            Some(key) => {
                let payload = self.blobs.get(&self.bucket, &key).await?;
                (payload.to_vec(), Provenance::oversized(&self.bucket, &key))
            }
            None => (
                received.body().unwrap_or_default().as_bytes().to_vec(),
                Provenance::inline(),
            ),
        };

        let mut message = Message::new(payload)
            .with_provenance(provenance)
            .with_receipt_handle(receipt);
        message.attributes = attributes;
        Ok(message)
    }

    /// Decode everything that can be decoded. A message that cannot is left
    /// on the queue, where redrive eventually moves it to the dead letter queue.
    async fn decode_all(&self, received: &[SqsMessage]) -> Vec<Message> {
        let mut messages = Vec::with_capacity(received.len());
        for item in received {
            match self.decode(item).await {
                Ok(message) => messages.push(message),
                Err(e) => error!(
                    message_id = item.message_id().unwrap_or_default(),
                    "skipping undecodable message: {e}"
                ),
            }
        }
        messages
    }

    /// Build the send entry for a message. Returns the bucket key the payload
    /// was written to, if any.
    async fn encode(
        &self,
        id: usize,
        message: &Message,
        spill: bool,
    ) -> Result<(SendMessageBatchRequestEntry, Option<String>), QueueError> {
        let mut attributes = HashMap::with_capacity(message.attributes.len() + 1);
        for (name, value) in &message.attributes {
            attributes.insert(name.clone(), string_attribute(value)?);
        }

        let inline = match std::str::from_utf8(&message.payload) {
            Ok(body) if !spill => Some(body.to_owned()),
            _ => None,
        };

        let (body, spilled) = match inline {
            Some(body) => (body, None),
            None => {
                // the inbound object goes away with the inbound message, so always write a new one
                let key = Uuid::now_v7().to_string();
                self.blobs
                    .put(&self.bucket, &key, Bytes::from(message.payload.clone()))
                    .await?;
                attributes.insert(OVERSIZE_ATTRIBUTE.to_owned(), string_attribute(&key)?);
                (format!("s3://{}/{}", self.bucket, key), Some(key))
            }
        };

        let entry = SendMessageBatchRequestEntry::builder()
            .id(id.to_string())
            .message_body(body)
            .set_message_attributes((!attributes.is_empty()).then_some(attributes))
            .build()
            .map_err(|e| QueueError::MalformedMessage(e.to_string()))?;
        Ok((entry, spilled))
    }

    /// Remove objects written for entries that were never published.
    async fn discard_unsent(&self, spilled: &[(usize, String)], statuses: &[bool]) {
        for (ix, key) in spilled {
            if statuses.get(*ix).copied().unwrap_or(false) {
                continue;
            }
            if let Err(e) = self.blobs.delete(&self.bucket, key).await {
                warn!(bucket = %self.bucket, key, "failed to remove unsent payload: {e}");
            }
        }
    }

    /// Remove the bucket objects of oversized messages that were deleted.
    async fn release_deleted(&self, messages: &[Message], statuses: &[bool]) {
        for (message, deleted) in messages.iter().zip(statuses) {
            if !*deleted {
                continue;
            }
            if let Some((bucket, key)) = message.provenance().external_location() {
                if let Err(e) = self.blobs.delete(bucket, key).await {
                    warn!(bucket, key, "failed to remove oversized payload: {e}");
                }
            }
        }
    }
}

/// SQS queue client with transparent storage of oversized payloads.
pub struct SqsQueue {
    client: AwsSqsSdkClient,
    payloads: OversizePayloads,
}

impl SqsQueue {
    pub fn new(client: AwsSqsSdkClient, blobs: Arc<dyn BlobStore>, message_bucket: &str) -> Self {
        Self {
            client,
            payloads: OversizePayloads {
                blobs,
                bucket: message_bucket.to_owned(),
            },
        }
    }
}

fn string_attribute(value: &str) -> Result<MessageAttributeValue, QueueError> {
    MessageAttributeValue::builder()
        .data_type("String")
        .string_value(value)
        .build()
        .map_err(|e| QueueError::MalformedMessage(e.to_string()))
}

/// Map per-entry ids (request positions) back onto a status array.
fn statuses_from_ids<'a>(size: usize, successful: impl Iterator<Item = &'a str>) -> Vec<bool> {
    let mut statuses = vec![false; size];
    for id in successful {
        if let Some(status) = id.parse::<usize>().ok().and_then(|ix| statuses.get_mut(ix)) {
            *status = true;
        }
    }
    statuses
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn queue_handle(&self, name: &str) -> Result<QueueHandle, QueueError> {
        let output = self
            .client
            .get_queue_url()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| QueueError::OperationFailed(e.to_string()))?;

        output
            .queue_url()
            .map(QueueHandle::new)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_owned()))
    }

    async fn receive(
        &self,
        queue: &QueueHandle,
        wait: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        let wait_seconds = wait.as_secs().min(MAX_WAIT_SECONDS) as i32;
        let output = self
            .client
            .receive_message()
            .queue_url(queue.as_str())
            .max_number_of_messages(MAX_BLOCK_COUNT as i32)
            .wait_time_seconds(wait_seconds)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueError::OperationFailed(e.to_string()))?;

        Ok(self.payloads.decode_all(output.messages()).await)
    }

    async fn batch_put(
        &self,
        queue: &QueueHandle,
        messages: &[Message],
    ) -> Result<BatchOutcome, QueueError> {
        check_block_size(messages)?;
        if messages.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let plan = spill_plan(messages);
        let mut entries = Vec::with_capacity(messages.len());
        let mut spilled = Vec::new();
        for (ix, (message, spill)) in messages.iter().zip(plan).enumerate() {
            match self.payloads.encode(ix, message, spill).await {
                Ok((entry, key)) => {
                    entries.push(entry);
                    if let Some(key) = key {
                        spilled.push((ix, key));
                    }
                }
                // the item is reported as failed, the rest of the batch still goes out
                Err(e) => error!("cannot publish {}: {e}", message.describe(ix)),
            }
        }
        if entries.is_empty() {
            return Ok(BatchOutcome::new(vec![false; messages.len()]));
        }

        let result = self
            .client
            .send_message_batch()
            .queue_url(queue.as_str())
            .set_entries(Some(entries))
            .send()
            .await;
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                self.payloads.discard_unsent(&spilled, &[]).await;
                return Err(QueueError::OperationFailed(e.to_string()));
            }
        };

        for failed in output.failed() {
            warn!(
                id = failed.id(),
                code = failed.code(),
                "publish rejected: {}",
                failed.message().unwrap_or_default()
            );
        }

        let statuses = statuses_from_ids(
            messages.len(),
            output.successful().iter().map(|entry| entry.id()),
        );
        self.payloads.discard_unsent(&spilled, &statuses).await;
        Ok(BatchOutcome::new(statuses))
    }

    async fn batch_delete(
        &self,
        queue: &QueueHandle,
        messages: &[Message],
    ) -> Result<BatchOutcome, QueueError> {
        check_block_size(messages)?;
        if messages.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut entries = Vec::with_capacity(messages.len());
        for (ix, message) in messages.iter().enumerate() {
            let Some(receipt) = message.receipt_handle() else {
                error!("cannot delete {}: no receipt handle", message.describe(ix));
                continue;
            };
            let entry = DeleteMessageBatchRequestEntry::builder()
                .id(ix.to_string())
                .receipt_handle(receipt)
                .build()
                .map_err(|e| QueueError::MalformedMessage(e.to_string()))?;
            entries.push(entry);
        }
        if entries.is_empty() {
            return Ok(BatchOutcome::new(vec![false; messages.len()]));
        }

        let output = self
            .client
            .delete_message_batch()
            .queue_url(queue.as_str())
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| QueueError::OperationFailed(e.to_string()))?;

        for failed in output.failed() {
            warn!(
                id = failed.id(),
                code = failed.code(),
                "delete rejected: {}",
                failed.message().unwrap_or_default()
            );
        }

        let statuses = statuses_from_ids(
            messages.len(),
            output.successful().iter().map(|entry| entry.id()),
        );
        self.payloads.release_deleted(messages, &statuses).await;
        Ok(BatchOutcome::new(statuses))
    }
}
