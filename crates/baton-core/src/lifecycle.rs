//! Transition stamping for the queue state machine.
//!
//! Every backend routes message state changes through these helpers so the
//! counter and timestamp rules live in exactly one place:
//!
//! - `queue`: requeue count reset, both timestamps set to now.
//! - `requeue`: count incremented, `updated_at` moved, `enqueued_at` kept.
//! - `requeue_silent`: nothing stamped. Used when work returns to the queue
//!   without charging the message a delivery attempt (internal retries,
//!   orphan recovery).
//!
//! Each helper returns a fresh clone; the caller's message is never touched.

use crate::message::Message;

/// Stamp a first-time enqueue. `enqueued_at` is assigned here and never
/// again for this id.
pub fn prepare_enqueue(msg: &Message, now_ms: u64) -> Message {
    let mut copy = msg.clone();
    copy.requeue_count = 0;
    copy.enqueued_at = now_ms;
    copy.updated_at = now_ms;
    copy
}

/// Stamp a visible requeue: the delivered message goes back with its retry
/// counter charged.
///
/// Call this once per logical requeue, before any backend retry loop:
/// retries must re-submit the already-stamped clone (via the silent path) so
/// transient faults do not inflate the counter.
pub fn prepare_requeue(msg: &Message, now_ms: u64) -> Message {
    let mut copy = msg.clone();
    copy.requeue_count = copy.requeue_count.saturating_add(1);
    copy.updated_at = now_ms;
    copy
}

/// Clone for a silent requeue: counters and timestamps pass through
/// untouched.
pub fn prepare_requeue_silent(msg: &Message) -> Message {
    msg.clone()
}
