//! Durable message-queue abstraction with at-least-once delivery.
//!
//! Producers hand work to a [`Queue`]; consumers [`take`](Queue::take) it,
//! do the work, and [`finish`](Queue::finish). Unacknowledged work is
//! tracked in-flight and brought back by the [`OrphanRecoverer`]. Backends
//! are pluggable: in-memory, Redis, Postgres and Kafka adapters share the
//! same contract.

pub mod backend;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod idgen;
pub mod lifecycle;
pub mod message;
pub mod queue;
pub mod recovery;
pub mod telemetry;

pub(crate) mod executor;

pub use backend::inmem::InMemoryQueue;
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{Codec, JsonCodec};
pub use config::InMemoryConfig;
pub use error::{QueueError, QueueResult};
pub use idgen::IdGenerator;
pub use message::Message;
pub use queue::{ClientOwnership, Queue, SIZE_UNSUPPORTED};
pub use recovery::OrphanRecoverer;

#[cfg(feature = "kafka")]
pub use backend::kafka::KafkaQueue;
#[cfg(feature = "kafka")]
pub use config::{KafkaConfig, ProducerAck};

#[cfg(feature = "postgres")]
pub use backend::postgres::PostgresQueue;
#[cfg(feature = "postgres")]
pub use config::PostgresConfig;

#[cfg(feature = "redis")]
pub use backend::redis::RedisQueue;
#[cfg(feature = "redis")]
pub use config::RedisConfig;
