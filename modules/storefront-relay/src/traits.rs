//! The storage seam relays write through.

use async_trait::async_trait;
use storefront_events::{Event, PublishIntent, Recorded, Result, StoredEvent};

/// Records events and tracks whether they reached the channel.
///
/// Implemented by EventStore (postgres) and MemoryEventStore (tests).
#[async_trait]
pub trait EventPersister: Send + Sync {
    /// Record an event. An existing id yields `Recorded::Duplicate`.
    async fn record(&self, event: &Event, intent: &PublishIntent) -> Result<Recorded>;

    async fn find(&self, event_id: &str) -> Result<Option<StoredEvent>>;

    /// Flip a pending event to published. False if it was not pending.
    async fn mark_published(&self, event_id: &str) -> Result<bool>;

    /// Flip a held event to pending. False if it was not held.
    async fn release(&self, event_id: &str) -> Result<bool>;

    /// Pending events of `source`, oldest first.
    async fn pending(&self, source: &str, limit: usize) -> Result<Vec<StoredEvent>>;
}
