use async_trait::async_trait;

use crate::error::QueueResult;
use crate::message::Message;

/// The durable queue contract, implemented by every backend adapter.
///
/// Semantics are at-least-once: a message delivered by [`take`](Queue::take)
/// is tracked in ephemeral (in-flight) storage until the consumer either
/// acknowledges it with [`finish`](Queue::finish) or hands it back with
/// [`requeue`](Queue::requeue). In-flight work that is never acknowledged is
/// surfaced by [`orphan_messages`](Queue::orphan_messages) and restored with
/// [`move_from_ephemeral_to_queue`](Queue::move_from_ephemeral_to_queue).
///
/// Implementations are thread-safe and hold no cross-operation locks;
/// concurrent `take` calls may proceed in parallel, with atomicity delegated
/// to the backend (transactions, server-side scripts, or lock-free
/// containers). Backends that cannot honor an operation return
/// [`QueueError::Unsupported`](crate::QueueError::Unsupported) rather than
/// omitting it from the contract.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue a fresh copy of `msg`: requeue counter reset, both timestamps
    /// stamped. Returns `false` when a bounded backend rejects the message
    /// on overflow. The caller's copy is never mutated either way.
    async fn queue(&self, msg: &Message) -> QueueResult<bool>;

    /// Return a delivered message to the queue, charging it one requeue and
    /// moving its `updated_at`. The in-flight entry is released first so at
    /// most one copy of the id exists at any commit boundary.
    async fn requeue(&self, msg: &Message) -> QueueResult<bool>;

    /// Return a delivered message to the queue without touching its counter
    /// or timestamps. Used by internal fault retries and orphan recovery.
    async fn requeue_silent(&self, msg: &Message) -> QueueResult<bool>;

    /// Acknowledge a delivered message, releasing its in-flight entry.
    /// Idempotent: finishing an unknown or already-finished id is a no-op.
    async fn finish(&self, msg: &Message) -> QueueResult<()>;

    /// Deliver the head of the queue, recording it in-flight. `None` when
    /// the queue is empty or delivery is being backpressured.
    async fn take(&self) -> QueueResult<Option<Message>>;

    /// In-flight messages older than `threshold_ms`, capped at an
    /// implementation batch limit. Ordering is unspecified.
    async fn orphan_messages(&self, threshold_ms: u64) -> QueueResult<Vec<Message>>;

    /// Atomically move one in-flight message back to the queue, preserving
    /// its counter and timestamps. Returns `false` when the id is not
    /// in-flight (another actor already recovered or finished it).
    async fn move_from_ephemeral_to_queue(&self, msg: &Message) -> QueueResult<bool>;

    /// Best-effort queued count; `-1` when the backend cannot report one.
    /// Never fails: errors are logged and reported as `-1`.
    async fn queue_size(&self) -> i64;

    /// Best-effort in-flight count; `-1` when unsupported.
    async fn ephemeral_size(&self) -> i64;

    /// Release backend resources this queue owns. Borrowed clients are left
    /// running for their owner.
    async fn close(&self) -> QueueResult<()>;
}

/// Whether the adapter created its backend client (and must tear it down on
/// `close`) or borrowed one from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOwnership {
    Owned,
    Borrowed,
}

impl ClientOwnership {
    pub fn is_owned(self) -> bool {
        matches!(self, ClientOwnership::Owned)
    }
}

/// Size sentinel for backends (or configurations) without a countable store.
pub const SIZE_UNSUPPORTED: i64 = -1;
