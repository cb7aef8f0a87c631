/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel could not be reached at connect time.
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("{0} is not connected")]
    NotConnected(&'static str),

    /// A write was rejected or timed out.
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// The log is temporarily unreachable.
    #[error("Channel unavailable: {0}")]
    Unavailable(String),

    #[error("Partition {partition} out of range for {topic} ({partitions} partitions)")]
    UnknownPartition {
        topic: String,
        partition: i32,
        partitions: i32,
    },

    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),

    /// Retry budget spent and nowhere to dead-letter the message. Its offset
    /// was not committed.
    #[error("Gave up on {topic}/{partition}@{offset} after {attempts} attempts: {reason}")]
    RetriesExhausted {
        topic: String,
        partition: i32,
        offset: i64,
        attempts: u32,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ChannelError {
    /// Report a failed connect attempt. An error that already is a
    /// `Connection` error passes through unchanged.
    pub(crate) fn into_connection(self) -> Self {
        match self {
            already @ ChannelError::Connection(_) => already,
            other => ChannelError::Connection(other.to_string()),
        }
    }
}
