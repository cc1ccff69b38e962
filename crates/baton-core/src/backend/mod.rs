//! Backend adapters.
//!
//! Every adapter realizes the same narrow port over its native storage:
//! append to the queued store (`push`), remove its head (`pop`), record and
//! release in-flight entries (`stash` / `unstash`), count both stores, scan
//! in-flight entries older than a cutoff, and atomically move an entry from
//! in-flight back to queued. The [`Queue`](crate::Queue) operations are
//! compositions of those port operations with the stamping rules in
//! [`crate::lifecycle`]; how the composition is made atomic is the
//! adapter's business: serializable transactions (relational), server-side
//! scripts and `MULTI`/`EXEC` (key-value), lock-free containers
//! (in-memory), or the producer/consumer-group contract (log, which has no
//! in-flight store at all).

pub mod inmem;

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
