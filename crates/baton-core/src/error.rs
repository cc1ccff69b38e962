/// Error taxonomy for queue operations.
///
/// Backend client errors are carried as rendered strings so the taxonomy
/// stays `Send + Sync + 'static` regardless of which backend features are
/// compiled in. `Transient` covers faults a caller (or the internal retry
/// policy) may reasonably retry: network drops, timeouts, deadlocks and
/// serialization-failure aborts on relational backends.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Recoverable backend fault. Mutating operations retry these internally
    /// up to the configured bound before surfacing them.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Non-recoverable backend fault.
    #[error("backend error: {0}")]
    Backend(String),

    /// Payload could not be encoded or decoded by the codec.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend (or its configuration) cannot honor this operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Invalid or inconsistent configuration, raised at construction.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
            QueueError::Transient(err.to_string())
        } else {
            QueueError::Backend(err.to_string())
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                // 40001 = serialization_failure, 40P01 = deadlock_detected
                let code = db.code();
                let code = code.as_deref().unwrap_or("");
                if code == "40001" || code == "40P01" {
                    QueueError::Transient(err.to_string())
                } else {
                    QueueError::Backend(err.to_string())
                }
            }
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => {
                QueueError::Transient(err.to_string())
            }
            _ => QueueError::Backend(err.to_string()),
        }
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for QueueError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        QueueError::Backend(err.to_string())
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;
