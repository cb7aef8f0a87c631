//! Consumer runtime: group membership, the delivery loop, offset commits.
//!
//! One handler invocation is in flight at a time. An offset is committed
//! only once the message is settled: handled, dropped by the handler,
//! dead-lettered, or given up on under `FailurePolicy::CommitAndContinue`.
//! Stopping never interrupts a handler; it takes effect between messages or
//! during a retry backoff, and in the latter case the offset stays
//! uncommitted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use storefront_events::Event;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ChannelError, Result};
use crate::handler::{HandlerOutcome, MessageHandler};
use crate::log::{Message, MessageLog};
use crate::partition::partition_for_key;
use crate::policy::{DeliveryPolicy, FailurePolicy, StartFrom};
use crate::state::ConnectionState;

/// Backoff after a failed fetch or commit. The loop keeps going.
const TRANSIENT_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Why a delivery loop ended.
#[derive(Debug, Clone)]
pub enum LoopExit {
    /// Stopped on request.
    Stopped,
    /// Stopped on its own; the error says why.
    Failed(Arc<ChannelError>),
}

struct Subscription {
    topic: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Consumer {
    client_id: String,
    log: Arc<dyn MessageLog>,
    policy: DeliveryPolicy,
    state: Mutex<ConnectionState>,
    group_id: Mutex<Option<String>>,
    subscription: tokio::sync::Mutex<Option<Subscription>>,
    exit: Arc<watch::Sender<Option<LoopExit>>>,
}

impl Consumer {
    pub fn new(
        client_id: impl Into<String>,
        log: Arc<dyn MessageLog>,
        policy: DeliveryPolicy,
    ) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            client_id: client_id.into(),
            log,
            policy,
            state: Mutex::new(ConnectionState::Disconnected),
            group_id: Mutex::new(None),
            subscription: tokio::sync::Mutex::new(None),
            exit: Arc::new(exit),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    pub fn group_id(&self) -> Option<String> {
        self.group_id.lock().ok().and_then(|g| g.clone())
    }

    /// Join a consumer group. Fails with `ChannelError::Connection` if the
    /// channel cannot be reached.
    pub async fn connect(&self, group_id: &str) -> Result<()> {
        if self.state().is_connected() {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self.log.ping().await {
            self.set_state(ConnectionState::Disconnected);
            error!(client_id = %self.client_id, group_id, error = %e, "Consumer failed to connect");
            return Err(e.into_connection());
        }

        if let Ok(mut group) = self.group_id.lock() {
            *group = Some(group_id.to_string());
        }
        self.set_state(ConnectionState::Connected);
        info!(client_id = %self.client_id, group_id, "Consumer connected");
        Ok(())
    }

    /// Start delivering `topic` to `handler` in a background task.
    ///
    /// Each partition resumes at the group's committed offset, or at the
    /// policy's `start_from` position if the group never committed.
    pub async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let group_id = match (self.state().is_connected(), self.group_id()) {
            (true, Some(group_id)) => group_id,
            _ => return Err(ChannelError::NotConnected("consumer")),
        };

        let mut subscription = self.subscription.lock().await;
        if let Some(existing) = subscription.as_ref() {
            return Err(ChannelError::AlreadySubscribed(existing.topic.clone()));
        }

        let partitions = self.log.partitions(topic).await?;
        let mut positions = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            positions.push(self.start_position(&group_id, topic, partition).await?);
        }

        info!(group_id = %group_id, topic, partitions, ?positions, "Consumer subscribed");

        let (stop_tx, stop_rx) = watch::channel(false);
        let delivery = DeliveryLoop {
            log: self.log.clone(),
            handler,
            policy: self.policy.clone(),
            group_id,
            topic: topic.to_string(),
            positions,
            stop: stop_rx,
        };

        self.exit.send_replace(None);
        let exit = self.exit.clone();
        let task = tokio::spawn(async move {
            let outcome = match delivery.run().await {
                Ok(()) => LoopExit::Stopped,
                Err(e) => {
                    error!(error = %e, "Delivery loop stopped");
                    LoopExit::Failed(Arc::new(e))
                }
            };
            exit.send_replace(Some(outcome));
        });

        *subscription = Some(Subscription {
            topic: topic.to_string(),
            stop: stop_tx,
            task,
        });
        Ok(())
    }

    async fn start_position(&self, group_id: &str, topic: &str, partition: i32) -> Result<i64> {
        if let Some(committed) = self.log.committed(group_id, topic, partition).await? {
            return Ok(committed);
        }
        let watermarks = self.log.watermarks(topic, partition).await?;
        Ok(match self.policy.start_from {
            StartFrom::Earliest => watermarks.low,
            StartFrom::Latest => watermarks.high,
        })
    }

    /// Resolves once the current delivery loop has ended, either because
    /// `disconnect` stopped it or because it failed. Without a subscription
    /// there is no loop to wait for and this returns `LoopExit::Stopped`.
    pub async fn closed(&self) -> LoopExit {
        let mut rx = self.exit.subscribe();
        let no_exit_yet = rx.borrow().is_none();
        if no_exit_yet && self.subscription.lock().await.is_none() {
            return LoopExit::Stopped;
        }
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        };
        exit.unwrap_or(LoopExit::Stopped)
    }

    /// Stop the delivery loop once the in-flight handler returns, then leave
    /// the group. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        if let Some(subscription) = self.subscription.lock().await.take() {
            let _ = subscription.stop.send(true);
            if let Err(e) = subscription.task.await {
                error!(error = %e, topic = %subscription.topic, "Delivery task panicked");
            }
        }

        if self.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
            info!(client_id = %self.client_id, "Consumer disconnected");
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery loop
// ---------------------------------------------------------------------------

enum Step {
    Continue,
    Stop,
}

struct DeliveryLoop {
    log: Arc<dyn MessageLog>,
    handler: Arc<dyn MessageHandler>,
    policy: DeliveryPolicy,
    group_id: String,
    topic: String,
    /// Next offset to deliver, per partition.
    positions: Vec<i64>,
    stop: watch::Receiver<bool>,
}

impl DeliveryLoop {
    async fn run(mut self) -> Result<()> {
        loop {
            if self.stop_requested() {
                return Ok(());
            }

            match self.poll_once().await {
                Ok((_, Step::Stop)) => return Ok(()),
                Ok((0, Step::Continue)) => {
                    if self.sleep_or_stop(self.policy.poll_interval).await {
                        return Ok(());
                    }
                }
                Ok((_, Step::Continue)) => {}
                Err(e @ ChannelError::RetriesExhausted { .. }) => return Err(e),
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "Delivery poll failed, backing off");
                    if self.sleep_or_stop(TRANSIENT_ERROR_BACKOFF).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One pass over every partition. Returns how many messages settled.
    async fn poll_once(&mut self) -> Result<(usize, Step)> {
        let mut settled = 0;
        for partition in 0..self.positions.len() {
            let from = self.positions[partition];
            let batch = self
                .log
                .fetch(&self.topic, partition as i32, from, self.policy.batch_size)
                .await?;

            for message in batch {
                if let Step::Stop = self.deliver(&message).await? {
                    return Ok((settled, Step::Stop));
                }
                self.positions[partition] = message.offset + 1;
                settled += 1;

                if self.stop_requested() {
                    return Ok((settled, Step::Stop));
                }
            }
        }
        Ok((settled, Step::Continue))
    }

    /// Hand one message to the handler under the failure policy, then commit.
    async fn deliver(&mut self, message: &Message) -> Result<Step> {
        let event: Event = match serde_json::from_slice(&message.value) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Undecodable message"
                );
                self.dead_letter(message, &format!("undecodable: {e}")).await?;
                self.commit(message).await?;
                return Ok(Step::Continue);
            }
        };

        let failure = self.policy.failure.clone();
        let event_id = event.event_id().to_string();
        let mut attempt = 1u32;
        loop {
            match self.handler.handle(event.clone()).await {
                Ok(HandlerOutcome::Processed) => {
                    debug!(event_id = %event_id, offset = message.offset, "Message processed");
                    break;
                }
                Ok(HandlerOutcome::Dropped { reason }) => {
                    info!(event_id = %event_id, offset = message.offset, reason = %reason, "Message dropped by handler");
                    break;
                }
                Err(e) => match &failure {
                    FailurePolicy::CommitAndContinue => {
                        error!(
                            event_id = %event_id,
                            topic = %message.topic,
                            offset = message.offset,
                            error = %e,
                            "Handler failed, committing offset anyway"
                        );
                        break;
                    }
                    FailurePolicy::Retry(retry) => {
                        if !e.is_retryable() {
                            error!(event_id = %event_id, offset = message.offset, error = %e, "Handler failed permanently");
                            self.dead_letter(message, &e.to_string()).await?;
                            break;
                        }

                        if attempt >= retry.max_attempts {
                            if retry.dead_letter_topic.is_some() {
                                error!(event_id = %event_id, attempts = attempt, error = %e, "Retries exhausted");
                                self.dead_letter(message, &e.to_string()).await?;
                                break;
                            }
                            return Err(ChannelError::RetriesExhausted {
                                topic: message.topic.clone(),
                                partition: message.partition,
                                offset: message.offset,
                                attempts: attempt,
                                reason: e.to_string(),
                            });
                        }

                        let backoff = retry.backoff(attempt);
                        warn!(
                            event_id = %event_id,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Handler failed, retrying after backoff"
                        );
                        if self.sleep_or_stop(backoff).await {
                            return Ok(Step::Stop);
                        }
                        attempt += 1;
                    }
                },
            }
        }

        self.commit(message).await?;
        Ok(Step::Continue)
    }

    async fn commit(&self, message: &Message) -> Result<()> {
        self.log
            .commit(&self.group_id, &message.topic, message.partition, message.offset + 1)
            .await
    }

    /// Copy the raw record to the dead-letter topic, or log and skip it when
    /// none is configured.
    async fn dead_letter(&self, message: &Message, reason: &str) -> Result<()> {
        let Some(topic) = self.policy.dead_letter_topic() else {
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                reason,
                "No dead-letter topic configured, skipping message"
            );
            return Ok(());
        };

        let partitions = self.log.partitions(topic).await?;
        let partition = message
            .key
            .as_deref()
            .map(|key| partition_for_key(key, partitions))
            .unwrap_or(0);
        let metadata = self
            .log
            .append(topic, partition, message.key.as_deref(), &message.value)
            .await?;

        warn!(
            from_topic = %message.topic,
            from_offset = message.offset,
            dead_letter_topic = topic,
            dead_letter_offset = metadata.offset,
            reason,
            "Message dead-lettered"
        );
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Sleep for `duration` unless a stop arrives first. Returns true on stop.
    async fn sleep_or_stop(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.stop.wait_for(|stop| *stop) => true,
        }
    }
}
