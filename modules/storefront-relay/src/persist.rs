//! EventPersister implementations.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use storefront_events::{
    Event, EventStore, PublishIntent, PublishState, Recorded, Result, StoreError, StoredEvent,
};

use crate::traits::EventPersister;

// ---------------------------------------------------------------------------
// EventStore adapter (postgres)
// ---------------------------------------------------------------------------

#[async_trait]
impl EventPersister for EventStore {
    async fn record(&self, event: &Event, intent: &PublishIntent) -> Result<Recorded> {
        EventStore::record(self, event, intent).await
    }

    async fn find(&self, event_id: &str) -> Result<Option<StoredEvent>> {
        EventStore::find(self, event_id).await
    }

    async fn mark_published(&self, event_id: &str) -> Result<bool> {
        EventStore::mark_published(self, event_id).await
    }

    async fn release(&self, event_id: &str) -> Result<bool> {
        EventStore::release(self, event_id).await
    }

    async fn pending(&self, source: &str, limit: usize) -> Result<Vec<StoredEvent>> {
        EventStore::pending(self, source, limit).await
    }
}

// ---------------------------------------------------------------------------
// MemoryEventStore (tests, no database required)
// ---------------------------------------------------------------------------

/// In-memory event store for testing. Same duplicate and publish-state rules
/// as the Postgres store. Thread-safe.
pub struct MemoryEventStore {
    next_seq: AtomicI64,
    events: Mutex<Vec<StoredEvent>>,
    failing_records: AtomicU32,
    available: AtomicBool,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            next_seq: AtomicI64::new(1),
            events: Mutex::new(Vec::new()),
            failing_records: AtomicU32::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Read all recorded events (for test assertions).
    pub fn events(&self) -> Vec<StoredEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Recorded events of one topic.
    pub fn on_topic(&self, topic: &str) -> Vec<StoredEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.topic == topic)
            .collect()
    }

    /// Fail the next `n` calls to `record`.
    pub fn fail_next_records(&self, n: u32) {
        self.failing_records.store(n, Ordering::SeqCst);
    }

    /// While false, every operation fails with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".into()))
        }
    }
}

#[async_trait]
impl EventPersister for MemoryEventStore {
    async fn record(&self, event: &Event, intent: &PublishIntent) -> Result<Recorded> {
        self.check_available()?;
        let failing = self
            .failing_records
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("simulated write failure".into()));
        }

        let mut events = self.events.lock().unwrap();
        if events.iter().any(|e| e.event_id == event.event_id()) {
            return Ok(Recorded::Duplicate);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        events.push(StoredEvent::from_event(seq, event, intent));
        Ok(Recorded::Inserted(seq))
    }

    async fn find(&self, event_id: &str) -> Result<Option<StoredEvent>> {
        self.check_available()?;
        let events = self.events.lock().unwrap();
        Ok(events.iter().find(|e| e.event_id == event_id).cloned())
    }

    async fn mark_published(&self, event_id: &str) -> Result<bool> {
        self.check_available()?;
        let mut events = self.events.lock().unwrap();
        match events
            .iter_mut()
            .find(|e| e.event_id == event_id && e.publish_state == PublishState::Pending)
        {
            Some(stored) => {
                stored.publish_state = PublishState::Published;
                stored.published_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, event_id: &str) -> Result<bool> {
        self.check_available()?;
        let mut events = self.events.lock().unwrap();
        match events
            .iter_mut()
            .find(|e| e.event_id == event_id && e.publish_state == PublishState::Held)
        {
            Some(stored) => {
                stored.publish_state = PublishState::Pending;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending(&self, source: &str, limit: usize) -> Result<Vec<StoredEvent>> {
        self.check_available()?;
        let events = self.events.lock().unwrap();
        Ok(events
            .iter()
            .filter(|e| e.source == source && e.publish_state == PublishState::Pending)
            .take(limit)
            .cloned()
            .collect())
    }
}
