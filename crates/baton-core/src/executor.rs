//! Bounded retry of transient backend faults.
//!
//! Relational backends can abort an otherwise-correct transaction with a
//! deadlock or serialization failure; the fix is to run the same logical
//! operation again. This module owns that policy: retry
//! [`QueueError::Transient`] up to a bound, surface everything else (and the
//! final transient error) to the caller.
//!
//! Counter discipline matters here: requeue stamping happens once, before
//! the closure is handed to this executor, so a retried requeue re-submits
//! the same stamped clone instead of charging the message again.

use std::future::Future;

use tracing::warn;

use crate::error::{QueueError, QueueResult};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Run `f` until it succeeds, fails non-transiently, or `max_retries`
/// transient faults have been consumed. The closure receives the attempt
/// number (0-based) for logging.
pub async fn run_with_retries<T, F, Fut>(
    op: &'static str,
    max_retries: u32,
    f: F,
) -> QueueResult<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = QueueResult<T>>,
{
    let mut attempt = 0;
    loop {
        match f(attempt).await {
            Err(QueueError::Transient(cause)) if attempt < max_retries => {
                warn!(op, attempt, %cause, "transient backend failure, retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}
