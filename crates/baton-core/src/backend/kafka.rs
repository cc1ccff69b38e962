use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::Message as _;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::codec::{Codec, JsonCodec};
use crate::config::KafkaConfig;
use crate::error::{QueueError, QueueResult};
use crate::lifecycle;
use crate::message::Message;
use crate::queue::{ClientOwnership, Queue, SIZE_UNSUPPORTED};

/// Log-backed queue over a single topic.
///
/// The log has no ephemeral store: delivery tracking is the consumer
/// group's offset management, with auto-commit on the poll that delivered
/// the message. Consequences, all part of the contract here:
///
/// - `finish` is a **no-op**. The record was committed when `take` polled
///   it; there is nothing left to acknowledge.
/// - `orphan_messages` and `move_from_ephemeral_to_queue` are unsupported.
/// - Sizes are unknowable from the client and report `-1`.
///
/// Records are partitioned by the message's routing key, so per-key FIFO
/// holds but cross-partition ordering does not.
pub struct KafkaQueue {
    producer: FutureProducer,
    consumer: StreamConsumer,
    ownership: ClientOwnership,
    topic: String,
    send_async: bool,
    poll_timeout: Duration,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn Clock>,
}

impl KafkaQueue {
    /// Build producer and consumer from the configuration and subscribe to
    /// the topic.
    pub fn connect(config: KafkaConfig) -> QueueResult<Self> {
        Self::connect_with_clock(config, Arc::new(SystemClock))
    }

    pub fn connect_with_clock(config: KafkaConfig, clock: Arc<dyn Clock>) -> QueueResult<Self> {
        validate(&config)?;
        let producer: FutureProducer = producer_config(&config)
            .create()
            .map_err(|e| QueueError::Config(format!("kafka producer: {e}")))?;
        let consumer: StreamConsumer = consumer_config(&config, clock.as_ref())
            .create()
            .map_err(|e| QueueError::Config(format!("kafka consumer: {e}")))?;
        Self::assemble(producer, consumer, config, ClientOwnership::Owned, clock)
    }

    /// Build on caller-owned clients; `close` will not flush or unsubscribe
    /// them. The consumer must already be configured with a group id and
    /// auto-commit.
    pub fn with_clients(
        producer: FutureProducer,
        consumer: StreamConsumer,
        config: KafkaConfig,
    ) -> QueueResult<Self> {
        validate(&config)?;
        Self::assemble(
            producer,
            consumer,
            config,
            ClientOwnership::Borrowed,
            Arc::new(SystemClock),
        )
    }

    fn assemble(
        producer: FutureProducer,
        consumer: StreamConsumer,
        config: KafkaConfig,
        ownership: ClientOwnership,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| QueueError::Config(format!("subscribe to {:?}: {e}", config.topic)))?;
        Ok(Self {
            producer,
            consumer,
            ownership,
            topic: config.topic,
            send_async: config.send_async,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            codec: Arc::new(JsonCodec),
            clock,
        })
    }

    /// Swap the wire format used for record values.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Produce one stamped message, keyed for partitioning.
    async fn produce(&self, msg: &Message) -> QueueResult<bool> {
        let data = self.codec.encode(msg)?;
        let key = msg.routing_key();
        let record = FutureRecord::to(&self.topic).key(&key).payload(&data);

        if self.send_async {
            // Success means the record entered the client's send buffer.
            match self.producer.send_result(record) {
                Ok(_) => Ok(true),
                Err((e, _)) => Err(e.into()),
            }
        } else {
            // Success means the broker acknowledged the write.
            match self.producer.send(record, self.poll_timeout).await {
                Ok(_) => Ok(true),
                Err((e, _)) => Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl Queue for KafkaQueue {
    async fn queue(&self, msg: &Message) -> QueueResult<bool> {
        let stamped = lifecycle::prepare_enqueue(msg, self.clock.now_ms());
        self.produce(&stamped).await
    }

    async fn requeue(&self, msg: &Message) -> QueueResult<bool> {
        let stamped = lifecycle::prepare_requeue(msg, self.clock.now_ms());
        self.produce(&stamped).await
    }

    async fn requeue_silent(&self, msg: &Message) -> QueueResult<bool> {
        let stamped = lifecycle::prepare_requeue_silent(msg);
        self.produce(&stamped).await
    }

    /// No-op: the consumer group committed the offset when `take` delivered
    /// the record.
    async fn finish(&self, _msg: &Message) -> QueueResult<()> {
        Ok(())
    }

    async fn take(&self) -> QueueResult<Option<Message>> {
        match tokio::time::timeout(self.poll_timeout, self.consumer.recv()).await {
            Ok(Ok(record)) => match record.payload() {
                Some(bytes) => Ok(Some(self.codec.decode(bytes)?)),
                None => {
                    warn!(topic = %self.topic, "record with empty payload, skipping");
                    Ok(None)
                }
            },
            Ok(Err(e)) => Err(e.into()),
            // Poll window elapsed with nothing to deliver.
            Err(_) => Ok(None),
        }
    }

    async fn orphan_messages(&self, _threshold_ms: u64) -> QueueResult<Vec<Message>> {
        Err(QueueError::Unsupported("orphan_messages"))
    }

    async fn move_from_ephemeral_to_queue(&self, _msg: &Message) -> QueueResult<bool> {
        Err(QueueError::Unsupported("move_from_ephemeral_to_queue"))
    }

    async fn queue_size(&self) -> i64 {
        SIZE_UNSUPPORTED
    }

    async fn ephemeral_size(&self) -> i64 {
        SIZE_UNSUPPORTED
    }

    async fn close(&self) -> QueueResult<()> {
        if self.ownership.is_owned() {
            if let Err(e) = self.producer.flush(Duration::from_secs(5)) {
                warn!(error = %e, "failed to flush producer on close");
            }
            self.consumer.unsubscribe();
        }
        Ok(())
    }
}

fn validate(config: &KafkaConfig) -> QueueResult<()> {
    if config.bootstrap_servers.is_empty() {
        return Err(QueueError::Config("bootstrap_servers is required".to_string()));
    }
    if config.topic.is_empty() {
        return Err(QueueError::Config("topic is required".to_string()));
    }
    Ok(())
}

fn producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers.as_str())
        .set("acks", config.producer_ack_mode.acks_value());
    for (key, value) in &config.producer_props {
        client.set(key.as_str(), value.as_str());
    }
    client
}

fn consumer_config(config: &KafkaConfig, clock: &dyn Clock) -> ClientConfig {
    let group_id = if config.consumer_group_id.is_empty() {
        // Per-instance group: this queue sees the whole topic on its own.
        format!("baton-{}", clock.now_ms())
    } else {
        config.consumer_group_id.clone()
    };
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers.as_str())
        .set("group.id", group_id)
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", "earliest");
    for (key, value) in &config.consumer_props {
        client.set(key.as_str(), value.as_str());
    }
    client
}
