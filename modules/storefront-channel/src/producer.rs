//! Producer adapter: connection lifecycle, serialization and partitioning
//! over a `MessageLog`.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use storefront_events::Event;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{ChannelError, Result};
use crate::log::{MessageLog, RecordMetadata};
use crate::partition::Partitioner;
use crate::policy::RetryPolicy;
use crate::state::ConnectionState;

pub struct Producer {
    client_id: String,
    log: Arc<dyn MessageLog>,
    partitioner: Partitioner,
    state: Mutex<ConnectionState>,
    // Publishes hold a read guard; disconnect takes the write guard to wait
    // for them.
    in_flight: RwLock<()>,
}

impl Producer {
    pub fn new(client_id: impl Into<String>, log: Arc<dyn MessageLog>) -> Self {
        Self {
            client_id: client_id.into(),
            log,
            partitioner: Partitioner::new(),
            state: Mutex::new(ConnectionState::Disconnected),
            in_flight: RwLock::new(()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
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

    /// Connect to the channel. Connecting twice is a no-op.
    pub async fn connect(&self) -> Result<()> {
        if self.state().is_connected() {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);

        match self.log.ping().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!(client_id = %self.client_id, "Producer connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                error!(client_id = %self.client_id, error = %e, "Producer failed to connect");
                Err(e.into_connection())
            }
        }
    }

    /// `connect`, retried with the policy's backoff. Returns the last error
    /// once `max_attempts` is spent.
    pub async fn connect_with_retry(&self, policy: &RetryPolicy) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= policy.max_attempts => return Err(e),
                Err(e) => {
                    let backoff = policy.backoff(attempt);
                    warn!(
                        client_id = %self.client_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Producer connect failed, retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Serialize `payload` as JSON and append it to `topic`. Records sharing
    /// a key go to the same partition and keep their relative order.
    pub async fn publish<T>(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &T,
    ) -> Result<RecordMetadata>
    where
        T: Serialize + ?Sized,
    {
        let _guard = self.in_flight.read().await;
        if !self.state().is_connected() {
            return Err(ChannelError::Publish {
                topic: topic.to_string(),
                reason: "producer is not connected".into(),
            });
        }

        let value = serde_json::to_vec(payload)?;

        let partitions = self
            .log
            .partitions(topic)
            .await
            .map_err(|e| publish_error(topic, e))?;
        let partition = self.partitioner.partition(key, partitions);

        let metadata = self
            .log
            .append(topic, partition, key, &value)
            .await
            .map_err(|e| publish_error(topic, e))?;

        debug!(
            topic,
            partition = metadata.partition,
            offset = metadata.offset,
            "Message published"
        );
        Ok(metadata)
    }

    /// Publish a whole event to its own topic.
    pub async fn publish_event(&self, event: &Event, key: Option<&str>) -> Result<RecordMetadata> {
        self.publish(event.topic(), key, event).await
    }

    /// Stop accepting publishes, wait for in-flight ones, release the
    /// connection. Safe to call repeatedly or before `connect`.
    pub async fn disconnect(&self) {
        if !self.state().is_connected() {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        let _flushed = self.in_flight.write().await;
        info!(client_id = %self.client_id, "Producer disconnected");
    }
}

fn publish_error(topic: &str, e: ChannelError) -> ChannelError {
    match e {
        already @ ChannelError::Publish { .. } => already,
        other => ChannelError::Publish {
            topic: topic.to_string(),
            reason: other.to_string(),
        },
    }
}
