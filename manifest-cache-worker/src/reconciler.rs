use std::sync::Arc;

use manifest_cache_common::message::Message;
use manifest_cache_common::queue::{BatchOutcome, MessageQueue, QueueHandle};
use tracing::warn;

use crate::config::CachePolicy;
use crate::error::ReconcileError;
use crate::metrics_consts::{
    CACHE_FAILURES, DELETE_FAILURES, MESSAGES_DELIVERED, PUBLISH_FAILURES,
};
use crate::rewriter::DocumentRewriter;

/// The result of handling one block of inbound messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Per inbound position: true when the message was cached (or allowed
    /// through uncached) and published, i.e. submitted for deletion.
    pub dispositions: Vec<bool>,
    /// Outcome of the outbound publish, one status per forwarded message.
    pub publish: BatchOutcome,
    /// Outcome of the inbound delete, one status per message submitted.
    pub delete: BatchOutcome,
}

impl Reconciliation {
    /// One or more queue operations in the block were unsuccessful.
    pub fn is_partial(&self) -> bool {
        self.publish.is_partial() || self.delete.is_partial()
    }

    pub fn delivered(&self) -> usize {
        self.dispositions.iter().filter(|ok| **ok).count()
    }
}

/// Caches, republishes and then deletes a block of inbound messages, making
/// sure a message only leaves the inbound queue once it was handed off.
pub struct BatchReconciler {
    rewriter: DocumentRewriter,
    queue: Arc<dyn MessageQueue>,
    inbound: QueueHandle,
    outbound: QueueHandle,
    policy: CachePolicy,
}

impl BatchReconciler {
    pub fn new(
        rewriter: DocumentRewriter,
        queue: Arc<dyn MessageQueue>,
        inbound: QueueHandle,
        outbound: QueueHandle,
        policy: CachePolicy,
    ) -> Self {
        Self {
            rewriter,
            queue,
            inbound,
            outbound,
            policy,
        }
    }

    /// Process one block. An `Err` means a queue call failed as a whole and the
    /// block's fate is unknown; per-message failures are reported in the
    /// returned `Reconciliation` instead.
    pub async fn reconcile(
        &self,
        mut batch: Vec<Message>,
    ) -> Result<Reconciliation, ReconcileError> {
        let mut cache_signals = Vec::with_capacity(batch.len());
        for (ix, message) in batch.iter_mut().enumerate() {
            let cached = match self.rewriter.cache(message).await {
                Ok(()) => true,
                Err(e) => {
                    metrics::counter!(CACHE_FAILURES, "reason" => e.reason()).increment(1);
                    warn!("manifest caching failed for {} ({e})", message.describe(ix));
                    self.policy == CachePolicy::BestEffort
                }
            };
            cache_signals.push(cached);
        }

        // fresh copies so the inbound receipts stay with the inbound messages
        let outbound: Vec<Message> = batch
            .iter()
            .zip(&cache_signals)
            .filter(|(_, cached)| **cached)
            .map(|(message, _)| message.content_clone())
            .collect();

        let publish = if outbound.is_empty() {
            BatchOutcome::default()
        } else {
            self.queue
                .batch_put(&self.outbound, &outbound)
                .await
                .map_err(ReconcileError::Publish)?
        };
        for (ix, sent) in publish.statuses().iter().enumerate() {
            if !sent {
                warn!("{} failed to send to queue", describe(&outbound, ix));
            }
        }
        metrics::counter!(PUBLISH_FAILURES).increment(publish.failed_count() as u64);

        let dispositions = realign_dispositions(&cache_signals, publish.statuses());

        let deletable: Vec<Message> = batch
            .into_iter()
            .zip(&dispositions)
            .filter_map(|(message, done)| done.then_some(message))
            .collect();

        let delete = if deletable.is_empty() {
            BatchOutcome::default()
        } else {
            self.queue
                .batch_delete(&self.inbound, &deletable)
                .await
                .map_err(ReconcileError::Delete)?
        };
        // not retried here, the queue redelivers these and they get processed again
        for (ix, deleted) in delete.statuses().iter().enumerate() {
            if !deleted {
                warn!("{} failed to delete", describe(&deletable, ix));
            }
        }
        metrics::counter!(DELETE_FAILURES).increment(delete.failed_count() as u64);

        let reconciliation = Reconciliation {
            dispositions,
            publish,
            delete,
        };
        metrics::counter!(MESSAGES_DELIVERED).increment(reconciliation.delivered() as u64);
        Ok(reconciliation)
    }
}

fn describe(messages: &[Message], ix: usize) -> String {
    messages
        .get(ix)
        .map(|message| message.describe(ix))
        .unwrap_or_else(|| format!("message {ix}"))
}

/// Project publish statuses, which only cover the cached messages, back onto
/// the positions of the full block.
///
/// The outbound batch is the cached subsequence of the block, so the publish
/// status of block position `ix` sits at `ix - (cache failures before ix)`.
/// Uncached positions are never done.
pub fn realign_dispositions(cache_signals: &[bool], publish_statuses: &[bool]) -> Vec<bool> {
    let mut cache_failures = 0;
    cache_signals
        .iter()
        .enumerate()
        .map(|(ix, cached)| {
            if !cached {
                cache_failures += 1;
                return false;
            }
            publish_statuses
                .get(ix - cache_failures)
                .copied()
                .unwrap_or(false)
        })
        .collect()
}
