pub mod channel;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::errors::SourceError;

/// A message received from one partition of a partitioned source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceMessage {
    /// raw payload of message
    pub payload: Vec<u8>,
    /// Partition the message was read from
    pub partition_id: String,
    /// Position of the message within its partition
    pub offset: i64,
    pub sequence_number: i64,
    pub enqueued_time: Option<DateTime<Utc>>,
    /// Optional key/value headers for metadata.
    pub headers: HashMap<String, Vec<u8>>,
}

impl SourceMessage {
    pub fn new(partition_id: impl Into<String>, sequence_number: i64, payload: Vec<u8>) -> Self {
        Self {
            payload,
            partition_id: partition_id.into(),
            offset: sequence_number,
            sequence_number,
            enqueued_time: Some(Utc::now()),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// The messages returned by one receive call, in partition order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBatch {
    messages: Vec<SourceMessage>,
}

impl MessageBatch {
    pub fn new(messages: Vec<SourceMessage>) -> Self {
        Self { messages }
    }

    /// The batch handed to a handler when a receive produced nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[SourceMessage] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SourceMessage> {
        self.messages.iter()
    }

    pub fn last_sequence_number(&self) -> Option<i64> {
        self.messages.last().map(|m| m.sequence_number)
    }

    pub fn payload_bytes(&self) -> u64 {
        self.messages.iter().map(|m| m.payload.len() as u64).sum()
    }

    pub fn into_messages(self) -> Vec<SourceMessage> {
        self.messages
    }
}

impl From<Vec<SourceMessage>> for MessageBatch {
    fn from(messages: Vec<SourceMessage>) -> Self {
        Self::new(messages)
    }
}

impl IntoIterator for MessageBatch {
    type Item = SourceMessage;
    type IntoIter = std::vec::IntoIter<SourceMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

/// A single partition of a message source, e.g. an Event Hubs partition or a
/// Kafka topic partition.
pub trait PartitionSource: Send + Sync + 'static {
    /// Identifier of the partition this source reads.
    fn source_id(&self) -> &str;

    /// Receives up to `max_batch_size` messages.
    ///
    /// Implementations wait until messages are available or their receive
    /// timeout elapses. `Ok(None)` (or an empty batch) means the timeout
    /// elapsed without new messages and is not an error.
    fn receive(
        &self,
        max_batch_size: usize,
    ) -> impl Future<Output = Result<Option<MessageBatch>, SourceError>> + Send;
}

impl<T: PartitionSource> PartitionSource for Arc<T> {
    fn source_id(&self) -> &str {
        (**self).source_id()
    }

    fn receive(
        &self,
        max_batch_size: usize,
    ) -> impl Future<Output = Result<Option<MessageBatch>, SourceError>> + Send {
        (**self).receive(max_batch_size)
    }
}
