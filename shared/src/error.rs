use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the outbox store and the publish helpers.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("invalid outbox event: {0}")]
    InvalidEvent(String),

    #[error("outbox event {0} not found")]
    NotFound(Uuid),

    #[error("failed to encode event payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),
}

impl OutboxError {
    /// Storage errors end the current tick in the worker and abort the
    /// enclosing transaction in the API.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            OutboxError::Database(_) | OutboxError::Pool(_) | OutboxError::NotFound(_)
        )
    }
}

impl From<bb8::RunError<diesel_async::pooled_connection::PoolError>> for OutboxError {
    fn from(err: bb8::RunError<diesel_async::pooled_connection::PoolError>) -> Self {
        OutboxError::Pool(err.to_string())
    }
}

/// Errors talking to the message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to publish to topic {topic}: {cause}")]
    Publish { topic: String, cause: String },

    #[error("failed to fetch from topic {topic}: {cause}")]
    Fetch { topic: String, cause: String },

    #[error("failed to commit offset {offset} on {topic}[{partition}]: {cause}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        cause: String,
    },

    #[error("failed to reposition {topic}[{partition}] at offset {offset}: {cause}")]
    Seek {
        topic: String,
        partition: i32,
        offset: i64,
        cause: String,
    },

    #[error("broker client error: {0}")]
    Client(String),
}

/// Result of a domain operation invoked by a consumer.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The effect already exists; a known unique key rejected the write.
    #[error("duplicate effect on {0}")]
    DuplicateEffect(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl DomainError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DomainError::DuplicateEffect(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration missing: {0}")]
    Missing(&'static str),

    #[error("configuration invalid for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}
