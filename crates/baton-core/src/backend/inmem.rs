use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crossbeam_queue::{ArrayQueue, SegQueue};
use parking_lot::Mutex;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::config::InMemoryConfig;
use crate::error::{QueueError, QueueResult};
use crate::lifecycle;
use crate::message::Message;
use crate::queue::{Queue, SIZE_UNSUPPORTED};

/// Bounds at or below this use an array-backed store; larger bounds a
/// node-backed one, so huge boundaries don't preallocate their whole
/// capacity.
const ARRAY_BACKED_MAX: usize = 1024;

/// Queued store variants behind one push/pop surface.
enum Store {
    Unbounded(SegQueue<Message>),
    Array(ArrayQueue<Message>),
    Linked {
        inner: SegQueue<Message>,
        capacity: usize,
        len: AtomicUsize,
    },
}

impl Store {
    fn new(boundary: Option<usize>) -> Self {
        match boundary {
            None | Some(0) => Store::Unbounded(SegQueue::new()),
            Some(bound) if bound <= ARRAY_BACKED_MAX => Store::Array(ArrayQueue::new(bound)),
            Some(bound) => Store::Linked {
                inner: SegQueue::new(),
                capacity: bound,
                len: AtomicUsize::new(0),
            },
        }
    }

    /// `false` when a bounded store is full.
    fn push(&self, msg: Message) -> bool {
        match self {
            Store::Unbounded(q) => {
                q.push(msg);
                true
            }
            Store::Array(q) => q.push(msg).is_ok(),
            Store::Linked {
                inner,
                capacity,
                len,
            } => {
                // Optimistically reserve a slot; back out on overflow.
                if len.fetch_add(1, Ordering::AcqRel) >= *capacity {
                    len.fetch_sub(1, Ordering::AcqRel);
                    return false;
                }
                inner.push(msg);
                true
            }
        }
    }

    fn pop(&self) -> Option<Message> {
        match self {
            Store::Unbounded(q) => q.pop(),
            Store::Array(q) => q.pop(),
            Store::Linked { inner, len, .. } => {
                let msg = inner.pop();
                if msg.is_some() {
                    len.fetch_sub(1, Ordering::AcqRel);
                }
                msg
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Store::Unbounded(q) => q.len(),
            Store::Array(q) => q.len(),
            Store::Linked { len, .. } => len.load(Ordering::Acquire),
        }
    }
}

/// In-flight entry: the delivered message plus when it was taken.
struct InFlight {
    msg: Message,
    taken_at: u64,
}

/// In-memory queue, useful as a test double and for single-process
/// pipelines that don't need durability.
///
/// The queued store is lock-free; the in-flight store is a mutex-guarded
/// map keyed by id. An optional boundary makes `queue` refuse (return
/// `false`) on overflow, and an optional in-flight cap makes `take` report
/// an empty queue while the cap is saturated, pushing backpressure onto
/// consumers that stopped acknowledging.
impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("ephemeral_max_size", &self.ephemeral_max_size)
            .finish_non_exhaustive()
    }
}

pub struct InMemoryQueue {
    store: Store,
    ephemeral: Option<Mutex<HashMap<u64, InFlight>>>,
    ephemeral_max_size: Option<usize>,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueue {
    pub fn new(config: InMemoryConfig) -> QueueResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: InMemoryConfig, clock: Arc<dyn Clock>) -> QueueResult<Self> {
        if let (Some(cap), true) = (config.ephemeral_max_size, config.ephemeral_disabled) {
            return Err(QueueError::Config(format!(
                "ephemeral_max_size ({cap}) set but ephemeral storage is disabled"
            )));
        }
        Ok(Self {
            store: Store::new(config.boundary),
            ephemeral: (!config.ephemeral_disabled).then(|| Mutex::new(HashMap::new())),
            ephemeral_max_size: config.ephemeral_max_size,
            clock,
        })
    }

    /// Record a delivered message in-flight. Duplicate ids are tolerated:
    /// the earlier entry (and its take-time) wins.
    fn stash(&self, msg: &Message) {
        let Some(ephemeral) = &self.ephemeral else {
            return;
        };
        let mut guard = ephemeral.lock();
        if guard.contains_key(&msg.id) {
            warn!(id = msg.id, "message already in-flight, keeping earlier entry");
            return;
        }
        guard.insert(
            msg.id,
            InFlight {
                msg: msg.clone(),
                taken_at: self.clock.now_ms(),
            },
        );
    }

    fn unstash(&self, id: u64) {
        if let Some(ephemeral) = &self.ephemeral {
            ephemeral.lock().remove(&id);
        }
    }

    /// Requeue body shared by the visible and silent paths: release the
    /// in-flight entry, then append. If a bounded store overflows, the
    /// in-flight entry is restored so the message survives somewhere.
    fn requeue_stamped(&self, original_id: u64, stamped: Message) -> bool {
        let reinstate = self.ephemeral.as_ref().and_then(|e| e.lock().remove(&original_id));
        if self.store.push(stamped) {
            return true;
        }
        if let (Some(ephemeral), Some(entry)) = (&self.ephemeral, reinstate) {
            ephemeral.lock().entry(original_id).or_insert(entry);
        }
        false
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn queue(&self, msg: &Message) -> QueueResult<bool> {
        let stamped = lifecycle::prepare_enqueue(msg, self.clock.now_ms());
        Ok(self.store.push(stamped))
    }

    async fn requeue(&self, msg: &Message) -> QueueResult<bool> {
        let stamped = lifecycle::prepare_requeue(msg, self.clock.now_ms());
        Ok(self.requeue_stamped(msg.id, stamped))
    }

    async fn requeue_silent(&self, msg: &Message) -> QueueResult<bool> {
        let stamped = lifecycle::prepare_requeue_silent(msg);
        Ok(self.requeue_stamped(msg.id, stamped))
    }

    async fn finish(&self, msg: &Message) -> QueueResult<()> {
        self.unstash(msg.id);
        Ok(())
    }

    async fn take(&self) -> QueueResult<Option<Message>> {
        if let (Some(ephemeral), Some(cap)) = (&self.ephemeral, self.ephemeral_max_size) {
            if ephemeral.lock().len() >= cap {
                return Ok(None);
            }
        }
        let Some(msg) = self.store.pop() else {
            return Ok(None);
        };
        self.stash(&msg);
        Ok(Some(msg))
    }

    async fn orphan_messages(&self, threshold_ms: u64) -> QueueResult<Vec<Message>> {
        let Some(ephemeral) = &self.ephemeral else {
            return Err(QueueError::Unsupported("orphan_messages"));
        };
        let now = self.clock.now_ms();
        let orphans = ephemeral
            .lock()
            .values()
            .filter(|entry| entry.taken_at.saturating_add(threshold_ms) < now)
            .take(crate::recovery::DEFAULT_BATCH_LIMIT)
            .map(|entry| entry.msg.clone())
            .collect();
        Ok(orphans)
    }

    async fn move_from_ephemeral_to_queue(&self, msg: &Message) -> QueueResult<bool> {
        let Some(ephemeral) = &self.ephemeral else {
            return Err(QueueError::Unsupported("move_from_ephemeral_to_queue"));
        };
        let Some(entry) = ephemeral.lock().remove(&msg.id) else {
            return Ok(false);
        };
        if self.store.push(entry.msg.clone()) {
            Ok(true)
        } else {
            ephemeral.lock().entry(msg.id).or_insert(entry);
            Ok(false)
        }
    }

    async fn queue_size(&self) -> i64 {
        self.store.len() as i64
    }

    async fn ephemeral_size(&self) -> i64 {
        match &self.ephemeral {
            Some(ephemeral) => ephemeral.lock().len() as i64,
            None => SIZE_UNSUPPORTED,
        }
    }

    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}
