//! The contract between the consumer runtime and business logic.

use async_trait::async_trait;
use storefront_events::Event;

/// What a handler did with a message it accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Fully handled.
    Processed,
    /// Deliberately ignored (e.g. failed validation). Never retried.
    Dropped { reason: String },
}

/// A failed handler invocation.
#[derive(Debug, thiserror::Error)]
#[error("{inner:#}")]
pub struct HandlerError {
    retryable: bool,
    inner: anyhow::Error,
}

impl HandlerError {
    /// Transient failure; the consumer may deliver the message again.
    pub fn retryable(source: impl Into<anyhow::Error>) -> Self {
        Self {
            retryable: true,
            inner: source.into(),
        }
    }

    /// Retrying cannot help.
    pub fn fatal(source: impl Into<anyhow::Error>) -> Self {
        Self {
            retryable: false,
            inner: source.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }
}

/// Handles one decoded event at a time. The consumer waits for the returned
/// future before touching the next message or committing the offset.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<HandlerOutcome, HandlerError>;
}
