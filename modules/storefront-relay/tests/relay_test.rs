//! Relay behavior over the in-memory channel and store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use storefront_channel::{
    ChannelError, Consumer, DeliveryPolicy, FailurePolicy, LoopExit, MemoryMessageLog,
    MessageLog, Producer, RetryPolicy, StartFrom,
};
use storefront_common::{
    IdStrategy, RelayKind, EMAIL_SERVICE_TOPIC, NOTIFICATION_TOPIC, USER_REGISTRATION_TOPIC,
};
use storefront_events::{
    Event, PublishIntent, PublishState, Recorded, Result as StoreResult, StoreError, StoredEvent,
};
use storefront_relay::{
    EventEmitter, EventPersister, MemoryEventStore, NotificationRelay, NotificationRequest,
    NotificationSender, PendingPublisher, RelayHandler, RelayOutcome, RelayRoute, ValidationError,
    WelcomeRelay,
};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    log: Arc<MemoryMessageLog>,
    store: Arc<MemoryEventStore>,
    producer: Arc<Producer>,
}

impl Harness {
    async fn new() -> Self {
        let log = Arc::new(MemoryMessageLog::new(3));
        let producer = Arc::new(Producer::new("test", log.clone()));
        producer.connect().await.unwrap();
        Self {
            log,
            store: Arc::new(MemoryEventStore::new()),
            producer,
        }
    }

    fn welcome(&self, strategy: IdStrategy) -> RelayHandler {
        RelayHandler::new(
            Arc::new(WelcomeRelay),
            RelayRoute::default_for(RelayKind::Welcome),
            self.store.clone(),
            self.producer.clone(),
            strategy,
        )
    }

    fn notification(&self, sender: Arc<dyn NotificationSender>) -> RelayHandler {
        RelayHandler::new(
            Arc::new(NotificationRelay::new(sender)),
            RelayRoute::default_for(RelayKind::Notification),
            self.store.clone(),
            self.producer.clone(),
            IdStrategy::Derived,
        )
    }

    fn published(&self, topic: &str) -> Vec<Event> {
        self.log
            .messages(topic)
            .iter()
            .map(|m| serde_json::from_slice(&m.value).unwrap())
            .collect()
    }
}

fn registration() -> Event {
    Event::with_id(
        "evt_1",
        "UserService",
        USER_REGISTRATION_TOPIC,
        json!({"email": "a@b.com", "name": "Ana"}),
        Some(json!({"userId": "usr_1"})),
    )
}

/// Records every request. Fails the first `failures` sends.
#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<NotificationRequest>>,
    failures: AtomicU32,
}

impl RecordingSender {
    fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Default::default()
        }
    }

    fn sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, request: &NotificationRequest) -> anyhow::Result<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("provider down");
        }
        self.sent.lock().unwrap().push(request.clone());
        Ok(())
    }
}

fn fast_policy(max_attempts: u32) -> DeliveryPolicy {
    DeliveryPolicy {
        failure: FailurePolicy::Retry(RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            jitter: Duration::ZERO,
            dead_letter_topic: None,
        }),
        start_from: StartFrom::Earliest,
        poll_interval: Duration::from_millis(5),
        batch_size: 10,
    }
}

async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// =========================================================================
// Welcome relay
// =========================================================================

#[tokio::test]
async fn registration_becomes_one_notification_and_one_log() {
    let h = Harness::new().await;
    let consumed = registration();

    let outcome = h.welcome(IdStrategy::Derived).process(&consumed).await.unwrap();
    let RelayOutcome::Relayed { outbound_id, log_id } = outcome else {
        panic!("expected the event to be relayed, got {outcome:?}");
    };

    let published = h.published(NOTIFICATION_TOPIC);
    assert_eq!(published.len(), 1);
    let outbound = &published[0];
    assert_eq!(outbound.event_id(), outbound_id);
    assert_eq!(outbound.source(), "WelcomeService");
    assert_eq!(outbound.payload()["to"], "a@b.com");
    assert_eq!(outbound.payload()["subject"], "¡Bienvenido a nuestra plataforma!");
    assert_eq!(outbound.original_event_id(), Some("evt_1"));
    assert_eq!(outbound.snapshot_str("status"), Some("WELCOME_NOTIFICATION_QUEUED"));
    assert_eq!(outbound.snapshot_str("targetUserId"), Some("usr_1"));

    let stored = h.store.find(&outbound_id).await.unwrap().unwrap();
    assert_eq!(stored.publish_state, PublishState::Published);
    assert_eq!(stored.partition_key.as_deref(), Some("a@b.com"));

    let log = h.store.find(&log_id).await.unwrap().unwrap();
    assert_eq!(log.publish_state, PublishState::Local);
    assert_eq!(log.topic, USER_REGISTRATION_TOPIC);
    let log = log.to_event();
    assert_eq!(log.snapshot_str("processedEventId"), Some("evt_1"));
    assert_eq!(log.snapshot_str("downstreamEventId"), Some(outbound_id.as_str()));
    assert_eq!(log.snapshot_str("status"), Some("PROCESSED_USER_REGISTRATION"));
    assert_eq!(log.payload(), &consumed.to_value().unwrap());

    // Nothing about the log event goes on the channel.
    assert!(h.published(USER_REGISTRATION_TOPIC).is_empty());
}

#[tokio::test]
async fn missing_email_is_dropped_without_side_effects() {
    let h = Harness::new().await;
    let consumed = Event::with_id(
        "evt_2",
        "UserService",
        USER_REGISTRATION_TOPIC,
        json!({"name": "Ana"}),
        Some(json!({"userId": "usr_1"})),
    );

    let outcome = h.welcome(IdStrategy::Derived).process(&consumed).await.unwrap();

    assert_eq!(
        outcome,
        RelayOutcome::Dropped(ValidationError::missing_payload("evt_2", "email"))
    );
    assert!(h.published(NOTIFICATION_TOPIC).is_empty());
    assert!(h.store.events().is_empty());
}

#[tokio::test]
async fn random_ids_relay_a_replay_twice() {
    let h = Harness::new().await;
    let handler = h.welcome(IdStrategy::Random);

    handler.process(&registration()).await.unwrap();
    handler.process(&registration()).await.unwrap();

    let published = h.published(NOTIFICATION_TOPIC);
    assert_eq!(published.len(), 2);
    assert_ne!(published[0].event_id(), published[1].event_id());
    assert_eq!(h.store.events().len(), 4);
}

#[tokio::test]
async fn derived_ids_relay_a_replay_at_most_once() {
    let h = Harness::new().await;
    let handler = h.welcome(IdStrategy::Derived);

    let first = handler.process(&registration()).await.unwrap();
    let second = handler.process(&registration()).await.unwrap();

    let RelayOutcome::Relayed { outbound_id, .. } = first else {
        panic!("first delivery should relay");
    };
    assert_eq!(second, RelayOutcome::AlreadyRelayed { outbound_id });
    assert_eq!(h.published(NOTIFICATION_TOPIC).len(), 1);
    assert_eq!(h.store.events().len(), 2);
}

#[tokio::test]
async fn failed_publish_leaves_outbound_pending_and_retry_finishes_it() {
    let h = Harness::new().await;
    let handler = h.welcome(IdStrategy::Derived);
    h.log.fail_next_appends(1);

    let err = handler.process(&registration()).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(h.published(NOTIFICATION_TOPIC).is_empty());
    let pending = h.store.pending("WelcomeService", 10).await.unwrap();
    assert_eq!(pending.len(), 1);

    let outcome = handler.process(&registration()).await.unwrap();
    assert!(matches!(outcome, RelayOutcome::Relayed { ref outbound_id, .. } if *outbound_id == pending[0].event_id));
    assert_eq!(h.published(NOTIFICATION_TOPIC).len(), 1);
    assert!(h.store.pending("WelcomeService", 10).await.unwrap().is_empty());
    assert_eq!(h.store.events().len(), 2);
}

#[tokio::test]
async fn partial_persist_fails_the_delivery_before_publishing() {
    let h = Harness::new().await;
    let handler = h.welcome(IdStrategy::Derived);
    h.store.fail_next_records(1);

    let err = handler.process(&registration()).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(h.published(NOTIFICATION_TOPIC).is_empty());
    assert_eq!(h.store.events().len(), 1);

    handler.process(&registration()).await.unwrap();
    assert_eq!(h.published(NOTIFICATION_TOPIC).len(), 1);
    assert_eq!(h.store.events().len(), 2);
}

// =========================================================================
// Through the consumer
// =========================================================================

#[tokio::test]
async fn channel_outage_keeps_offset_until_redelivery_succeeds() {
    let h = Harness::new().await;
    h.producer
        .publish_event(&registration(), Some("a@b.com"))
        .await
        .unwrap();
    h.log.fail_next_appends(u32::MAX);

    let consumer = Consumer::new("welcome", h.log.clone(), fast_policy(2));
    consumer.connect("welcome-service-group").await.unwrap();
    consumer
        .subscribe(USER_REGISTRATION_TOPIC, Arc::new(h.welcome(IdStrategy::Derived)))
        .await
        .unwrap();

    let exit = consumer.closed().await;
    let LoopExit::Failed(e) = exit else {
        panic!("expected the delivery loop to give up");
    };
    assert!(matches!(*e, ChannelError::RetriesExhausted { .. }));
    consumer.disconnect().await;

    let partitions = h.log.partitions(USER_REGISTRATION_TOPIC).await.unwrap();
    for p in 0..partitions {
        assert_eq!(
            h.log
                .committed("welcome-service-group", USER_REGISTRATION_TOPIC, p)
                .await
                .unwrap(),
            None
        );
    }

    // Broker is back; a restarted worker gets the same event again.
    h.log.fail_next_appends(0);
    let consumer = Consumer::new("welcome", h.log.clone(), fast_policy(2));
    consumer.connect("welcome-service-group").await.unwrap();
    consumer
        .subscribe(USER_REGISTRATION_TOPIC, Arc::new(h.welcome(IdStrategy::Derived)))
        .await
        .unwrap();

    eventually(|| h.log.messages(NOTIFICATION_TOPIC).len() == 1).await;
    consumer.disconnect().await;

    assert_eq!(h.store.on_topic(NOTIFICATION_TOPIC).len(), 1);
    assert!(h.store.on_topic(NOTIFICATION_TOPIC)[0].is_published());
}

#[tokio::test]
async fn registration_flows_through_to_email_service() {
    let h = Harness::new().await;
    let sender = Arc::new(RecordingSender::default());

    let welcome = Consumer::new("welcome", h.log.clone(), fast_policy(3));
    welcome.connect("welcome-service-group").await.unwrap();
    welcome
        .subscribe(USER_REGISTRATION_TOPIC, Arc::new(h.welcome(IdStrategy::Derived)))
        .await
        .unwrap();

    let notification = Consumer::new("notification", h.log.clone(), fast_policy(3));
    notification.connect("notification-service-group").await.unwrap();
    notification
        .subscribe(NOTIFICATION_TOPIC, Arc::new(h.notification(sender.clone())))
        .await
        .unwrap();

    let emitter = EventEmitter::new("UserService", h.store.clone(), h.producer.clone());
    let registered = emitter
        .create_and_publish(
            USER_REGISTRATION_TOPIC,
            Some("a@b.com"),
            json!({"email": "a@b.com", "name": "Ana"}),
            Some(json!({"userId": "usr_1", "status": "REGISTERED"})),
        )
        .await
        .unwrap();

    eventually(|| h.log.messages(EMAIL_SERVICE_TOPIC).len() == 1).await;
    welcome.disconnect().await;
    notification.disconnect().await;

    let request = h.published(NOTIFICATION_TOPIC).remove(0);
    assert_eq!(request.original_event_id(), Some(registered.event_id()));

    let handover = h.published(EMAIL_SERVICE_TOPIC).remove(0);
    assert_eq!(handover.original_event_id(), Some(request.event_id()));
    assert_eq!(handover.snapshot_str("notificationType"), Some("WELCOME"));
    assert_eq!(handover.snapshot_str("status"), Some("NOTIFICATION_SENT_TO_PROVIDER"));

    let sent = sender.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].origin, "WelcomeService");
    assert_eq!(sent[0].to, "a@b.com");
}

// =========================================================================
// Notification relay
// =========================================================================

#[tokio::test]
async fn notification_is_sent_once_per_request() {
    let h = Harness::new().await;
    let sender = Arc::new(RecordingSender::default());
    let handler = h.notification(sender.clone());

    let request = Event::with_id(
        "evt_9",
        "OrderService",
        NOTIFICATION_TOPIC,
        json!({"to": "a@b.com", "subject": "Factura ord_1", "content": "Gracias."}),
        Some(json!({"orderId": "ord_1"})),
    );

    handler.process(&request).await.unwrap();
    handler.process(&request).await.unwrap();

    assert_eq!(sender.sent.lock().unwrap().len(), 1);
    let handover = h.published(EMAIL_SERVICE_TOPIC);
    assert_eq!(handover.len(), 1);
    assert_eq!(handover[0].snapshot_str("notificationType"), Some("INVOICE"));
    assert_eq!(h.log.messages(EMAIL_SERVICE_TOPIC)[0].key.as_deref(), Some("a@b.com"));
}

fn cart_reminder() -> Event {
    Event::with_id(
        "evt_10",
        "CartService",
        NOTIFICATION_TOPIC,
        json!({"to": "a@b.com", "subject": "Tu carrito", "content": "Vuelve."}),
        None,
    )
}

#[tokio::test]
async fn provider_failure_holds_the_outbound_event() {
    let h = Harness::new().await;
    let sender = Arc::new(RecordingSender::failing(1));
    let handler = h.notification(sender.clone());

    let err = handler.process(&cart_reminder()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(sender.sent(), 0);
    assert!(h.published(EMAIL_SERVICE_TOPIC).is_empty());

    let held = h.store.on_topic(EMAIL_SERVICE_TOPIC);
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].publish_state, PublishState::Held);

    // The sweep leaves held events alone.
    let sweeper = PendingPublisher::new(
        RelayKind::Notification.service_name(),
        h.store.clone(),
        h.producer.clone(),
    );
    assert_eq!(sweeper.sweep(10).await.unwrap(), 0);
    assert!(h.published(EMAIL_SERVICE_TOPIC).is_empty());

    handler.process(&cart_reminder()).await.unwrap();
    assert_eq!(sender.sent(), 1);
    assert_eq!(h.published(EMAIL_SERVICE_TOPIC).len(), 1);
    assert_eq!(h.store.on_topic(EMAIL_SERVICE_TOPIC)[0].publish_state, PublishState::Published);
}

#[tokio::test]
async fn store_failure_before_dispatch_does_not_send_twice() {
    let h = Harness::new().await;
    let sender = Arc::new(RecordingSender::default());
    let handler = h.notification(sender.clone());
    h.store.fail_next_records(1);

    let err = handler.process(&cart_reminder()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(sender.sent(), 0);

    handler.process(&cart_reminder()).await.unwrap();
    handler.process(&cart_reminder()).await.unwrap();
    assert_eq!(sender.sent(), 1);
    assert_eq!(h.published(EMAIL_SERVICE_TOPIC).len(), 1);
}

/// Fails the first write of an event that is ready to publish, letting
/// held and local-only writes through.
struct FailFirstPublishWrite {
    inner: Arc<MemoryEventStore>,
    armed: AtomicU32,
}

#[async_trait]
impl EventPersister for FailFirstPublishWrite {
    async fn record(&self, event: &Event, intent: &PublishIntent) -> StoreResult<Recorded> {
        let publishing = matches!(intent, PublishIntent::Publish { .. });
        if publishing && self.armed.swap(0, Ordering::SeqCst) == 1 {
            return Err(StoreError::Unavailable("simulated write failure".into()));
        }
        self.inner.record(event, intent).await
    }

    async fn find(&self, event_id: &str) -> StoreResult<Option<StoredEvent>> {
        self.inner.find(event_id).await
    }

    async fn mark_published(&self, event_id: &str) -> StoreResult<bool> {
        self.inner.mark_published(event_id).await
    }

    async fn release(&self, event_id: &str) -> StoreResult<bool> {
        self.inner.release(event_id).await
    }

    async fn pending(&self, source: &str, limit: usize) -> StoreResult<Vec<StoredEvent>> {
        self.inner.pending(source, limit).await
    }
}

#[tokio::test]
async fn partial_persist_after_dispatch_does_not_send_twice() {
    let h = Harness::new().await;
    let sender = Arc::new(RecordingSender::default());
    let persister = Arc::new(FailFirstPublishWrite {
        inner: h.store.clone(),
        armed: AtomicU32::new(1),
    });
    let handler = RelayHandler::new(
        Arc::new(NotificationRelay::new(sender.clone())),
        RelayRoute::default_for(RelayKind::Notification),
        persister,
        h.producer.clone(),
        IdStrategy::Derived,
    );

    let err = handler.process(&cart_reminder()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(sender.sent(), 1);
    assert!(h.published(EMAIL_SERVICE_TOPIC).is_empty());

    handler.process(&cart_reminder()).await.unwrap();
    handler.process(&cart_reminder()).await.unwrap();
    assert_eq!(sender.sent(), 1);
    assert_eq!(h.published(EMAIL_SERVICE_TOPIC).len(), 1);
    assert_eq!(h.store.events().len(), 2);
}

// =========================================================================
// Emitter and pending sweep
// =========================================================================

#[tokio::test]
async fn failed_emit_is_finished_by_the_sweep() {
    let h = Harness::new().await;
    let emitter = EventEmitter::new("UserService", h.store.clone(), h.producer.clone());
    h.log.fail_next_appends(1);

    let err = emitter
        .create_and_publish(
            USER_REGISTRATION_TOPIC,
            Some("a@b.com"),
            json!({"email": "a@b.com", "name": "Ana"}),
            None,
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(h.published(USER_REGISTRATION_TOPIC).is_empty());

    let sweeper = PendingPublisher::new("UserService", h.store.clone(), h.producer.clone());
    assert_eq!(sweeper.sweep(10).await.unwrap(), 1);
    assert_eq!(sweeper.sweep(10).await.unwrap(), 0);

    let published = h.log.messages(USER_REGISTRATION_TOPIC);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key.as_deref(), Some("a@b.com"));
    assert!(h.store.events()[0].is_published());
}
