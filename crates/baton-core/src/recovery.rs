use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::queue::Queue;

/// Upper bound on orphans processed per [`OrphanRecoverer::run_once`] cycle.
pub const DEFAULT_BATCH_LIMIT: usize = 100;

/// Requeues in-flight work whose consumer never acknowledged it.
///
/// The recoverer is driven externally (a scheduler, a maintenance loop, a
/// cron tick). Each cycle scans one batch of orphans and moves them back to
/// the queued store through the backend's atomic move, leaving counters
/// untouched so the redelivered message still reports its true requeue
/// history. Per-message failures are logged and skipped; the cycle keeps
/// going.
pub struct OrphanRecoverer {
    queue: Arc<dyn Queue>,
    threshold_ms: u64,
}

impl OrphanRecoverer {
    /// `threshold_ms` is the age after which an unacknowledged in-flight
    /// message counts as abandoned.
    pub fn new(queue: Arc<dyn Queue>, threshold_ms: u64) -> Self {
        Self {
            queue,
            threshold_ms,
        }
    }

    /// Run one recovery cycle. Returns how many messages were moved back to
    /// the queued store.
    #[tracing::instrument(skip_all, fields(threshold_ms = self.threshold_ms))]
    pub async fn run_once(&self) -> QueueResult<usize> {
        let orphans = match self.queue.orphan_messages(self.threshold_ms).await {
            Ok(orphans) => orphans,
            Err(QueueError::Unsupported(op)) => {
                debug!(op, "backend has no ephemeral store, nothing to recover");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let mut recovered = 0usize;
        for orphan in &orphans {
            match self.queue.move_from_ephemeral_to_queue(orphan).await {
                Ok(true) => {
                    debug!(
                        id = orphan.id,
                        requeue_count = orphan.requeue_count,
                        "requeued orphaned message"
                    );
                    recovered += 1;
                }
                Ok(false) => {
                    // Another actor finished or recovered it first.
                    debug!(id = orphan.id, "orphan already gone, skipping");
                }
                Err(e) => {
                    warn!(id = orphan.id, error = %e, "failed to requeue orphan");
                }
            }
        }

        if recovered > 0 {
            info!(recovered, scanned = orphans.len(), "orphan recovery cycle done");
        }
        Ok(recovered)
    }
}
