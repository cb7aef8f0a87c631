//! EventEmitter: how request handlers put a new event into the system.

use std::sync::Arc;

use serde_json::Value;
use storefront_channel::Producer;
use storefront_events::{Event, PublishIntent};
use tracing::{info, warn};

use crate::error::Result;
use crate::traits::EventPersister;

pub struct EventEmitter {
    source: String,
    persister: Arc<dyn EventPersister>,
    producer: Arc<Producer>,
}

impl EventEmitter {
    pub fn new(
        source: impl Into<String>,
        persister: Arc<dyn EventPersister>,
        producer: Arc<Producer>,
    ) -> Self {
        Self {
            source: source.into(),
            persister,
            producer,
        }
    }

    /// Record a new event as pending, publish it, then mark it published.
    ///
    /// A failed publish leaves the record pending for `PendingPublisher` and
    /// is returned to the caller, who should report it as an internal error.
    pub async fn create_and_publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Value,
        snapshot: Option<Value>,
    ) -> Result<Event> {
        let event = Event::new(self.source.as_str(), topic, payload, snapshot);
        let intent = PublishIntent::Publish {
            key: key.map(str::to_string),
        };
        self.persister.record(&event, &intent).await?;

        if let Err(e) = self.producer.publish_event(&event, key).await {
            warn!(event_id = event.event_id(), topic, error = %e, "Publish failed, event left pending");
            return Err(e.into());
        }
        self.persister.mark_published(event.event_id()).await?;

        info!(event_id = event.event_id(), source = %self.source, topic, "Event emitted");
        Ok(event)
    }
}
