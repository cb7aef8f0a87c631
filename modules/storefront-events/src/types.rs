//! Core types: the wire event and its storage record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Canonical event document. This exact shape is the message value on the
/// channel (camelCase JSON) and the logical content of an event store row.
///
/// Fields are private: an event is immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    event_id: String,
    timestamp: DateTime<Utc>,
    source: String,
    topic: String,
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    snapshot: Option<Value>,
}

impl Event {
    /// New event with a fresh `evt_<uuid>` id, stamped now.
    pub fn new(
        source: impl Into<String>,
        topic: impl Into<String>,
        payload: Value,
        snapshot: Option<Value>,
    ) -> Self {
        Self::with_id(Self::generate_id(), source, topic, payload, snapshot)
    }

    /// New event with a caller-chosen id, stamped now.
    pub fn with_id(
        event_id: impl Into<String>,
        source: impl Into<String>,
        topic: impl Into<String>,
        payload: Value,
        snapshot: Option<Value>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp: Utc::now(),
            source: source.into(),
            topic: topic.into(),
            payload,
            snapshot,
        }
    }

    /// `evt_` + random UUIDv4.
    pub fn generate_id() -> String {
        format!("evt_{}", Uuid::new_v4())
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn snapshot(&self) -> Option<&Value> {
        self.snapshot.as_ref()
    }

    /// A non-empty string field of the payload.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        non_empty_str(Some(&self.payload), field)
    }

    /// A non-empty string field of the snapshot.
    pub fn snapshot_str(&self, field: &str) -> Option<&str> {
        non_empty_str(self.snapshot.as_ref(), field)
    }

    /// The event this one was derived from, if it records one.
    pub fn original_event_id(&self) -> Option<&str> {
        self.snapshot_str("originalEventId")
    }

    /// The whole event as a JSON value (used when an event becomes the
    /// payload of a processing-log event).
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} from {})", self.event_id, self.topic, self.source)
    }
}

fn non_empty_str<'a>(value: Option<&'a Value>, field: &str) -> Option<&'a str> {
    value?
        .get(field)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Storage layer
// ---------------------------------------------------------------------------

/// Whether a stored event still has to reach the message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishState {
    /// Recorded for audit only, never published (processing logs).
    Local,
    /// Recorded ahead of a side effect. Not published until released.
    Held,
    /// Recorded, publication not yet confirmed.
    Pending,
    /// Publication confirmed.
    Published,
}

impl PublishState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishState::Local => "local",
            PublishState::Held => "held",
            PublishState::Pending => "pending",
            PublishState::Published => "published",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "local" => Some(PublishState::Local),
            "held" => Some(PublishState::Held),
            "pending" => Some(PublishState::Pending),
            "published" => Some(PublishState::Published),
            _ => None,
        }
    }
}

/// What the caller intends to do with an event it is recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishIntent {
    LocalOnly,
    /// Publish only after `release`.
    Hold { key: Option<String> },
    Publish { key: Option<String> },
}

impl PublishIntent {
    pub fn keyed(key: impl Into<String>) -> Self {
        PublishIntent::Publish {
            key: Some(key.into()),
        }
    }

    pub fn held(key: impl Into<String>) -> Self {
        PublishIntent::Hold {
            key: Some(key.into()),
        }
    }

    pub(crate) fn initial_state(&self) -> PublishState {
        match self {
            PublishIntent::LocalOnly => PublishState::Local,
            PublishIntent::Hold { .. } => PublishState::Held,
            PublishIntent::Publish { .. } => PublishState::Pending,
        }
    }

    pub(crate) fn key(&self) -> Option<&str> {
        match self {
            PublishIntent::LocalOnly => None,
            PublishIntent::Hold { key } | PublishIntent::Publish { key } => key.as_deref(),
        }
    }
}

/// Result of recording an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// New row with this sequence number.
    Inserted(i64),
    /// An event with the same id already exists. Nothing was written.
    Duplicate,
}

/// An event as stored. Returned by all read methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub seq: i64,
    pub event_id: String,
    pub ts: DateTime<Utc>,
    pub source: String,
    pub topic: String,
    pub payload: Value,
    pub snapshot: Option<Value>,
    pub partition_key: Option<String>,
    pub publish_state: PublishState,
    pub recorded_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl StoredEvent {
    /// Build the storage record for `event`. Used by non-Postgres stores;
    /// Postgres assigns `seq` and `recorded_at` itself.
    pub fn from_event(seq: i64, event: &Event, intent: &PublishIntent) -> Self {
        Self {
            seq,
            event_id: event.event_id.clone(),
            ts: event.timestamp,
            source: event.source.clone(),
            topic: event.topic.clone(),
            payload: event.payload.clone(),
            snapshot: event.snapshot.clone(),
            partition_key: intent.key().map(str::to_string),
            publish_state: intent.initial_state(),
            recorded_at: Utc::now(),
            published_at: None,
        }
    }

    /// The canonical event this record stores.
    pub fn to_event(&self) -> Event {
        Event {
            event_id: self.event_id.clone(),
            timestamp: self.ts,
            source: self.source.clone(),
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            snapshot: self.snapshot.clone(),
        }
    }

    pub fn is_published(&self) -> bool {
        self.publish_state == PublishState::Published
    }

    pub fn is_held(&self) -> bool {
        self.publish_state == PublishState::Held
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serializes_with_wire_field_names() {
        let event = Event::with_id(
            "evt_1",
            "UserService",
            "user-registration",
            json!({"email": "a@b.com", "name": "Ana"}),
            Some(json!({"userId": "usr_1"})),
        );

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["eventId"], "evt_1");
        assert_eq!(value["source"], "UserService");
        assert_eq!(value["topic"], "user-registration");
        assert_eq!(value["payload"]["email"], "a@b.com");
        assert_eq!(value["snapshot"]["userId"], "usr_1");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn accepts_documents_from_other_services() {
        // Shape written by the node services: ISO timestamp with millis, no snapshot.
        let raw = r#"{
            "eventId": "evt_abc",
            "timestamp": "2025-03-01T10:15:30.123Z",
            "source": "CartService",
            "topic": "cart-removals",
            "payload": {"userId": "usr_9", "productId": "p-1"}
        }"#;

        let event: Event = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_id(), "evt_abc");
        assert!(event.snapshot().is_none());
        assert_eq!(event.payload_str("productId"), Some("p-1"));
        assert!(event.original_event_id().is_none());
    }

    #[test]
    fn blank_strings_count_as_missing() {
        let event = Event::new(
            "UserService",
            "user-registration",
            json!({"email": "  ", "name": 42}),
            Some(json!({"originalEventId": "evt_0"})),
        );

        assert_eq!(event.payload_str("email"), None);
        assert_eq!(event.payload_str("name"), None);
        assert_eq!(event.original_event_id(), Some("evt_0"));
    }

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let a = Event::generate_id();
        let b = Event::generate_id();
        assert!(a.starts_with("evt_"));
        assert_ne!(a, b);
    }

    #[test]
    fn stored_record_round_trips_to_event() {
        let event = Event::new("OrderService", "order-created", json!({"orderId": "o-1"}), None);
        let stored = StoredEvent::from_event(7, &event, &PublishIntent::keyed("usr_1"));

        assert_eq!(stored.publish_state, PublishState::Pending);
        assert_eq!(stored.partition_key.as_deref(), Some("usr_1"));
        assert_eq!(stored.to_event(), event);
    }
}
