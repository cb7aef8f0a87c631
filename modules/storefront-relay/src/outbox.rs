//! PendingPublisher: finish publishes that were recorded but never confirmed.

use std::sync::Arc;

use storefront_channel::Producer;
use tracing::{info, warn};

use crate::error::Result;
use crate::traits::EventPersister;

/// Default batch for one sweep.
pub const SWEEP_LIMIT: usize = 500;

pub struct PendingPublisher {
    source: String,
    persister: Arc<dyn EventPersister>,
    producer: Arc<Producer>,
}

impl PendingPublisher {
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

    /// Publish up to `limit` pending events of this source, oldest first.
    /// Stops at the first publish failure. Returns how many were published.
    pub async fn sweep(&self, limit: usize) -> Result<usize> {
        let pending = self.persister.pending(&self.source, limit).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        info!(source = %self.source, count = pending.len(), "Publishing pending events");
        let mut published = 0;
        for stored in pending {
            let event = stored.to_event();
            if let Err(e) = self
                .producer
                .publish_event(&event, stored.partition_key.as_deref())
                .await
            {
                warn!(event_id = %stored.event_id, error = %e, published, "Pending sweep interrupted");
                return Err(e.into());
            }
            self.persister.mark_published(&stored.event_id).await?;
            published += 1;
        }

        info!(source = %self.source, published, "Pending events published");
        Ok(published)
    }
}
