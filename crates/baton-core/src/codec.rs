use crate::error::QueueResult;
use crate::message::Message;

/// Byte-level wire format for messages stored in external backends.
///
/// Codecs are pure: no I/O, no state. Backends that persist serialized
/// messages (key-value, relational, log) accept an `Arc<dyn Codec>` and
/// default to [`JsonCodec`].
pub trait Codec: Send + Sync {
    fn encode(&self, msg: &Message) -> QueueResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> QueueResult<Message>;
}

/// JSON wire format via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, msg: &Message) -> QueueResult<Vec<u8>> {
        Ok(serde_json::to_vec(msg)?)
    }

    fn decode(&self, bytes: &[u8]) -> QueueResult<Message> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
