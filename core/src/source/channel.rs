use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tracing::debug;

use crate::errors::SourceError;
use crate::source::{MessageBatch, PartitionSource, SourceMessage};

/// An in-process partition fed through a tokio channel.
///
/// Used by the container runner's load generator and by tests. A receive
/// waits up to `receive_timeout` for the first message, then drains whatever
/// else is already buffered.
pub struct ChannelSource {
    partition_id: String,
    receive_timeout: Duration,
    receiver: Mutex<mpsc::Receiver<SourceMessage>>,
}

impl ChannelSource {
    pub fn new(
        partition_id: impl Into<String>,
        receive_timeout: Duration,
    ) -> (Self, mpsc::Sender<SourceMessage>) {
        Self::with_capacity(partition_id, receive_timeout, 1024)
    }

    pub fn with_capacity(
        partition_id: impl Into<String>,
        receive_timeout: Duration,
        capacity: usize,
    ) -> (Self, mpsc::Sender<SourceMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let source = Self {
            partition_id: partition_id.into(),
            receive_timeout,
            receiver: Mutex::new(rx),
        };
        (source, tx)
    }
}

impl PartitionSource for ChannelSource {
    fn source_id(&self) -> &str {
        &self.partition_id
    }

    async fn receive(&self, max_batch_size: usize) -> Result<Option<MessageBatch>, SourceError> {
        let mut receiver = self.receiver.lock().await;

        let first = match timeout(self.receive_timeout, receiver.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                return Err(SourceError::Closed {
                    source_id: self.partition_id.clone(),
                });
            }
            Err(_) => {
                debug!(
                    "Receive on partition {} timed out after {:?}",
                    self.partition_id, self.receive_timeout
                );
                return Ok(None);
            }
        };

        let mut messages = Vec::with_capacity(max_batch_size.min(64));
        messages.push(first);
        while messages.len() < max_batch_size {
            match receiver.try_recv() {
                Ok(message) => messages.push(message),
                Err(_) => break,
            }
        }

        Ok(Some(MessageBatch::new(messages)))
    }
}
