use serde::{Deserialize, Serialize};

/// Core message domain type, shared by every backend.
///
/// A message is identified by `id`; `0` means "not yet assigned", and
/// backends that require a non-zero id synthesize one at enqueue time. The two
/// timestamps are wall-clock epoch milliseconds: `enqueued_at` is stamped
/// exactly once, on the first successful `queue()`; `updated_at` moves on
/// every visible transition (queue, requeue). `requeue_count` is incremented
/// only by visible requeues and never decreases.
///
/// Queue operations always work on a clone stamped by [`crate::lifecycle`];
/// a caller's `Message` is never mutated by the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub requeue_count: u32,
    pub enqueued_at: u64,
    pub updated_at: u64,
    pub payload: Vec<u8>,
    /// Routing token for partitioned backends. When absent, the id routes.
    pub partition_key: Option<String>,
}

impl Message {
    /// A message with no id; backends that need one will assign it.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self::with_id(0, payload)
    }

    pub fn with_id(id: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            requeue_count: 0,
            enqueued_at: 0,
            updated_at: 0,
            payload: payload.into(),
            partition_key: None,
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// The key partitioned backends route by: the explicit partition key if
    /// present, the id otherwise.
    pub fn routing_key(&self) -> String {
        match &self.partition_key {
            Some(key) => key.clone(),
            None => self.id.to_string(),
        }
    }
}
