//! RelayHandler: consume one event, derive an outbound event and a
//! processing log, persist both, then publish the outbound one.
//!
//! Ordering per consumed event:
//!
//! 1. validate (failure drops the event)
//! 2. look up the outbound record; if it is already published, stop
//! 3. relays with a side effect: record outbound (held), dispatch, release
//!    it to pending. Only a held or missing record dispatches.
//! 4. record outbound (pending) and log (local) concurrently
//! 5. publish outbound, keyed
//! 6. mark outbound published
//!
//! Any failure after step 1 is returned to the consumer, which retries the
//! whole sequence. Every write is idempotent under derived ids, so a retry
//! only repeats what did not happen. The one exception is a store failure
//! between a successful dispatch and its release, which dispatches again.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use storefront_channel::{HandlerError, HandlerOutcome, MessageHandler, Producer};
use storefront_common::{IdStrategy, RelayKind};
use storefront_events::{Event, PublishIntent, Recorded};
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, Result, ValidationError};
use crate::ids::{OutboundIds, Role};
use crate::traits::EventPersister;

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// What a relay derives from a valid consumed event. The handler adds the
/// lineage fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    /// Partition key of the outbound event.
    pub key: String,
    pub payload: Value,
    pub snapshot: Map<String, Value>,
    /// `status` of the processing-log event.
    pub log_status: &'static str,
}

/// The per-service part of a relay.
#[async_trait]
pub trait Relay: Send + Sync {
    fn kind(&self) -> RelayKind;

    /// Check the consumed event and describe the outbound event.
    fn accept(&self, consumed: &Event) -> std::result::Result<Accepted, ValidationError>;

    /// Whether `dispatch` does anything. Such relays hold their outbound
    /// record until the side effect has succeeded.
    fn has_side_effect(&self) -> bool {
        false
    }

    /// Side effect performed once per consumed event, while the outbound
    /// record is held. Skipped once that record has been released.
    async fn dispatch(&self, _consumed: &Event, _accepted: &Accepted) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Where a relay reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRoute {
    pub consume_topic: String,
    pub produce_topic: String,
}

impl RelayRoute {
    pub fn new(consume_topic: impl Into<String>, produce_topic: impl Into<String>) -> Self {
        Self {
            consume_topic: consume_topic.into(),
            produce_topic: produce_topic.into(),
        }
    }

    pub fn default_for(kind: RelayKind) -> Self {
        Self::new(kind.default_consume_topic(), kind.default_produce_topic())
    }
}

/// What happened to one consumed event.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Relayed { outbound_id: String, log_id: String },
    /// A previous delivery already published the outbound event.
    AlreadyRelayed { outbound_id: String },
    Dropped(ValidationError),
}

// ---------------------------------------------------------------------------
// RelayHandler
// ---------------------------------------------------------------------------

pub struct RelayHandler {
    relay: Arc<dyn Relay>,
    route: RelayRoute,
    persister: Arc<dyn EventPersister>,
    producer: Arc<Producer>,
    ids: OutboundIds,
}

impl RelayHandler {
    pub fn new(
        relay: Arc<dyn Relay>,
        route: RelayRoute,
        persister: Arc<dyn EventPersister>,
        producer: Arc<Producer>,
        strategy: IdStrategy,
    ) -> Self {
        let ids = OutboundIds::new(strategy, relay.kind().service_name());
        Self {
            relay,
            route,
            persister,
            producer,
            ids,
        }
    }

    fn service(&self) -> &'static str {
        self.relay.kind().service_name()
    }

    pub async fn process(&self, consumed: &Event) -> Result<RelayOutcome> {
        let service = self.service();
        debug!(service, event_id = consumed.event_id(), topic = consumed.topic(), "Processing event");

        let accepted = match self.relay.accept(consumed) {
            Ok(accepted) => accepted,
            Err(invalid) => {
                warn!(service, error = %invalid, "Dropping event");
                return Ok(RelayOutcome::Dropped(invalid));
            }
        };

        let outbound_id = self.ids.id_for(consumed.event_id(), Role::Outbound);
        let log_id = self.ids.id_for(consumed.event_id(), Role::Log);

        let existing = self.persister.find(&outbound_id).await?;
        let (outbound, key) = match existing {
            Some(stored) if stored.is_published() => {
                info!(
                    service,
                    event_id = consumed.event_id(),
                    outbound_id = %outbound_id,
                    "Event already relayed"
                );
                return Ok(RelayOutcome::AlreadyRelayed { outbound_id });
            }
            Some(stored) if !stored.is_held() => {
                info!(service, outbound_id = %outbound_id, "Resuming unpublished outbound event");
                let key = stored.partition_key.clone().unwrap_or_else(|| accepted.key.clone());
                (stored.to_event(), key)
            }
            Some(held) => {
                info!(service, outbound_id = %outbound_id, "Retrying side effect of held outbound event");
                let key = held.partition_key.clone().unwrap_or_else(|| accepted.key.clone());
                let outbound = held.to_event();
                self.dispatch_held(consumed, &accepted, &outbound, &key).await?;
                (outbound, key)
            }
            None => {
                let outbound = self.outbound_event(&outbound_id, consumed, &accepted);
                let key = accepted.key.clone();
                if self.relay.has_side_effect() {
                    self.dispatch_held(consumed, &accepted, &outbound, &key).await?;
                }
                (outbound, key)
            }
        };

        let log = self.log_event(&log_id, consumed, outbound.event_id(), accepted.log_status)?;
        self.record_pair(&outbound, &key, &log).await?;

        self.producer.publish_event(&outbound, Some(&key)).await?;
        if !self.persister.mark_published(outbound.event_id()).await? {
            debug!(outbound_id = outbound.event_id(), "Outbound event was not pending");
        }

        info!(
            service,
            event_id = consumed.event_id(),
            outbound_id = outbound.event_id(),
            log_id = log.event_id(),
            topic = %self.route.produce_topic,
            "Event relayed"
        );
        Ok(RelayOutcome::Relayed {
            outbound_id: outbound.event_id().to_string(),
            log_id: log.event_id().to_string(),
        })
    }

    /// Record the outbound event as held, run the side effect, then release
    /// the record for publishing. A failed dispatch leaves the hold in place.
    async fn dispatch_held(
        &self,
        consumed: &Event,
        accepted: &Accepted,
        outbound: &Event,
        key: &str,
    ) -> Result<()> {
        self.persister
            .record(outbound, &PublishIntent::held(key))
            .await?;
        self.relay
            .dispatch(consumed, accepted)
            .await
            .map_err(RelayError::Dispatch)?;
        if !self.persister.release(outbound.event_id()).await? {
            debug!(outbound_id = outbound.event_id(), "Outbound event was not held");
        }
        Ok(())
    }

    fn outbound_event(&self, id: &str, consumed: &Event, accepted: &Accepted) -> Event {
        let mut snapshot = accepted.snapshot.clone();
        snapshot.insert("originalEventId".into(), json!(consumed.event_id()));
        Event::with_id(
            id,
            self.service(),
            self.route.produce_topic.clone(),
            accepted.payload.clone(),
            Some(Value::Object(snapshot)),
        )
    }

    fn log_event(
        &self,
        id: &str,
        consumed: &Event,
        outbound_id: &str,
        status: &str,
    ) -> Result<Event> {
        let payload = consumed
            .to_value()
            .map_err(storefront_events::StoreError::from)?;
        Ok(Event::with_id(
            id,
            self.service(),
            self.route.consume_topic.clone(),
            payload,
            Some(json!({
                "status": status,
                "downstreamEventId": outbound_id,
                "processedEventId": consumed.event_id(),
            })),
        ))
    }

    /// Both writes are independent, so they run concurrently. Either one
    /// failing fails the pair; whatever did land is kept and a retry
    /// records the rest.
    async fn record_pair(&self, outbound: &Event, key: &str, log: &Event) -> Result<()> {
        let outbound_intent = PublishIntent::keyed(key);
        let (outbound_result, log_result) = tokio::join!(
            self.persister.record(outbound, &outbound_intent),
            self.persister.record(log, &PublishIntent::LocalOnly),
        );

        match (outbound_result, log_result) {
            (Ok(o), Ok(l)) => {
                if o == Recorded::Duplicate || l == Recorded::Duplicate {
                    debug!(
                        outbound_id = outbound.event_id(),
                        log_id = log.event_id(),
                        outbound_duplicate = o == Recorded::Duplicate,
                        log_duplicate = l == Recorded::Duplicate,
                        "Relay records already present"
                    );
                }
                Ok(())
            }
            (Err(e), Ok(_)) => {
                error!(outbound_id = outbound.event_id(), error = %e, "Outbound record failed, log recorded");
                Err(RelayError::PartialPersist {
                    event_id: outbound.event_id().to_string(),
                    reason: e.to_string(),
                })
            }
            (Ok(_), Err(e)) => {
                error!(log_id = log.event_id(), error = %e, "Log record failed, outbound recorded");
                Err(RelayError::PartialPersist {
                    event_id: log.event_id().to_string(),
                    reason: e.to_string(),
                })
            }
            (Err(e), Err(_)) => Err(RelayError::Persist(e)),
        }
    }
}

#[async_trait]
impl MessageHandler for RelayHandler {
    async fn handle(&self, event: Event) -> std::result::Result<HandlerOutcome, HandlerError> {
        match self.process(&event).await {
            Ok(RelayOutcome::Dropped(invalid)) => Ok(HandlerOutcome::Dropped {
                reason: invalid.to_string(),
            }),
            Ok(_) => Ok(HandlerOutcome::Processed),
            Err(e) if e.is_retryable() => Err(HandlerError::retryable(e)),
            Err(e) => Err(HandlerError::fatal(e)),
        }
    }
}
