use storefront_channel::ChannelError;
use storefront_events::StoreError;

/// A consumed event that a relay cannot act on. Dropped, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("event {event_id} is missing {location}.{field}")]
    MissingField {
        event_id: String,
        location: &'static str,
        field: &'static str,
    },
}

impl ValidationError {
    pub fn missing_payload(event_id: &str, field: &'static str) -> Self {
        ValidationError::MissingField {
            event_id: event_id.to_string(),
            location: "payload",
            field,
        }
    }

    pub fn missing_snapshot(event_id: &str, field: &'static str) -> Self {
        ValidationError::MissingField {
            event_id: event_id.to_string(),
            location: "snapshot",
            field,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Persist failed: {0}")]
    Persist(#[from] StoreError),

    #[error("Publish failed: {0}")]
    Publish(#[from] ChannelError),

    #[error("Dispatch failed: {0:#}")]
    Dispatch(anyhow::Error),

    #[error("Partial persist for {event_id}: {reason}")]
    PartialPersist { event_id: String, reason: String },
}

impl RelayError {
    /// Whether running the same event again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Validation(_) => false,
            RelayError::Persist(StoreError::Serialization(_)) => false,
            RelayError::Publish(ChannelError::Serialization(_)) => false,
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
