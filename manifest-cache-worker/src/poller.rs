use std::sync::Arc;
use std::time::Duration;

use manifest_cache_common::message::Message;
use manifest_cache_common::queue::{MessageQueue, QueueHandle};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::WorkerError;
use crate::metrics_consts::MESSAGES_POLLED;

/// Long-polls the inbound queue and feeds the work channel.
pub struct QueuePoller {
    queue: Arc<dyn MessageQueue>,
    inbound: QueueHandle,
    poll_timeout: Duration,
}

impl QueuePoller {
    pub fn new(queue: Arc<dyn MessageQueue>, inbound: QueueHandle, poll_timeout: Duration) -> Self {
        Self {
            queue,
            inbound,
            poll_timeout,
        }
    }

    /// Poll until every worker is gone. A failed receive is fatal.
    pub async fn run(&self, sender: mpsc::Sender<Message>) -> Result<(), WorkerError> {
        while !sender.is_closed() {
            let messages = self
                .queue
                .receive(&self.inbound, self.poll_timeout)
                .await
                .map_err(WorkerError::Poll)?;

            metrics::counter!(MESSAGES_POLLED).increment(messages.len() as u64);

            for message in messages {
                // blocks while the workers are busy
                if sender.send(message).await.is_err() {
                    break;
                }
            }
        }

        info!("work channel closed, poller stopping");
        Ok(())
    }
}
