//! At-least-once relays between storefront topics.
//!
//! A relay consumes one event, derives an outbound event plus a processing
//! log, records both in the event store and publishes the outbound one.
//! `RelayHandler` owns that sequence; `WelcomeRelay` and
//! `NotificationRelay` only decide what to derive.

pub mod emitter;
pub mod error;
pub mod ids;
pub mod notification;
pub mod outbox;
pub mod persist;
pub mod relay;
pub mod traits;
pub mod welcome;

pub use emitter::EventEmitter;
pub use error::{RelayError, Result, ValidationError};
pub use ids::{OutboundIds, Role};
pub use notification::{
    LogNotificationSender, NotificationRelay, NotificationRequest, NotificationSender,
    NotificationType,
};
pub use outbox::{PendingPublisher, SWEEP_LIMIT};
pub use persist::MemoryEventStore;
pub use relay::{Accepted, Relay, RelayHandler, RelayOutcome, RelayRoute};
pub use traits::EventPersister;
pub use welcome::WelcomeRelay;

use std::sync::Arc;

use storefront_common::RelayKind;

/// The relay implementation for `kind`.
pub fn relay_for(kind: RelayKind, sender: Arc<dyn NotificationSender>) -> Arc<dyn Relay> {
    match kind {
        RelayKind::Welcome => Arc::new(WelcomeRelay),
        RelayKind::Notification => Arc::new(NotificationRelay::new(sender)),
    }
}
