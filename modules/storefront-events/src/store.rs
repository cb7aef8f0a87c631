//! EventStore: append-only event records backed by Postgres.
//!
//! `event_id` is unique. Recording the same id twice is not an error: the
//! second write is reported as `Recorded::Duplicate` and changes nothing,
//! which is what lets a redelivered message be relayed again safely.

use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::Result;
use crate::types::{Event, PublishIntent, PublishState, Recorded, StoredEvent};

/// Column list shared by every read.
const COLUMNS: &str = "seq, event_id, ts, source, topic, payload, snapshot, partition_key, \
                       publish_state, recorded_at, published_at";

/// Lineage walks stop here even if `originalEventId` links form a cycle.
const MAX_LINEAGE_DEPTH: i32 = 64;

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Cheap round trip used at startup to fail fast on a dead database.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Record an event. Duplicate ids are reported, not rejected.
    pub async fn record(&self, event: &Event, intent: &PublishIntent) -> Result<Recorded> {
        let seq = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO events
                (event_id, ts, source, topic, payload, snapshot, partition_key, publish_state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING seq
            "#,
        )
        .bind(event.event_id())
        .bind(event.timestamp())
        .bind(event.source())
        .bind(event.topic())
        .bind(event.payload())
        .bind(event.snapshot())
        .bind(intent.key())
        .bind(intent.initial_state().as_str())
        .fetch_optional(&self.pool)
        .await?;

        match seq {
            Some(seq) => Ok(Recorded::Inserted(seq)),
            None => {
                debug!(event_id = event.event_id(), "Event already recorded");
                Ok(Recorded::Duplicate)
            }
        }
    }

    /// Read a single event by id.
    pub async fn find(&self, event_id: &str) -> Result<Option<StoredEvent>> {
        let sql = format!("SELECT {COLUMNS} FROM events WHERE event_id = $1");
        let row = sqlx::query_as::<_, StoredEvent>(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Move a pending event to published. Returns false if the event was not
    /// pending (already published, local-only, or unknown).
    pub async fn mark_published(&self, event_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET publish_state = 'published', published_at = now()
            WHERE event_id = $1 AND publish_state = 'pending'
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Move a held event to pending, making it eligible for publication.
    /// Returns false if the event was not held.
    pub async fn release(&self, event_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE events SET publish_state = 'pending' WHERE event_id = $1 AND publish_state = 'held'",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Events from `source` still waiting for publication, oldest first.
    pub async fn pending(&self, source: &str, limit: usize) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM events \
             WHERE source = $1 AND publish_state = 'pending' \
             ORDER BY seq ASC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, StoredEvent>(&sql)
            .bind(source)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Events recorded for a topic after `after_seq`, in sequence order.
    pub async fn read_by_topic(
        &self,
        topic: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM events \
             WHERE topic = $1 AND seq > $2 \
             ORDER BY seq ASC LIMIT $3"
        );
        let rows = sqlx::query_as::<_, StoredEvent>(&sql)
            .bind(topic)
            .bind(after_seq)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// The causal chain ending at `event_id`, oldest ancestor first.
    ///
    /// Follows `snapshot.originalEventId` upward. Links to events this store
    /// never saw simply end the chain.
    pub async fn read_lineage(&self, event_id: &str) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            r#"
            WITH RECURSIVE chain AS (
                SELECT e.*, 0 AS depth FROM events e WHERE e.event_id = $1
                UNION ALL
                SELECT p.*, c.depth + 1
                FROM events p
                JOIN chain c ON p.event_id = c.snapshot->>'originalEventId'
                WHERE c.depth < $2
            )
            SELECT {COLUMNS} FROM chain ORDER BY depth DESC
            "#
        );
        let rows = sqlx::query_as::<_, StoredEvent>(&sql)
            .bind(event_id)
            .bind(MAX_LINEAGE_DEPTH)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Events derived directly from `event_id`: relayed events and the
    /// processing logs that recorded it.
    pub async fn read_derived(&self, event_id: &str) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM events \
             WHERE snapshot->>'originalEventId' = $1 OR snapshot->>'processedEventId' = $1 \
             ORDER BY seq ASC"
        );
        let rows = sqlx::query_as::<_, StoredEvent>(&sql)
            .bind(event_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Administrative cleanup: delete everything a source recorded.
    pub async fn purge_source(&self, source: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE source = $1")
            .bind(source)
            .execute(&self.pool)
            .await?;

        info!(source, deleted = result.rows_affected(), "Purged events");
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// sqlx::FromRow for StoredEvent
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEvent {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;

        let raw_state: String = row.try_get("publish_state")?;
        let publish_state =
            PublishState::parse(&raw_state).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "publish_state".into(),
                source: format!("unknown publish state: {raw_state}").into(),
            })?;

        Ok(StoredEvent {
            seq: row.try_get("seq")?,
            event_id: row.try_get("event_id")?,
            ts: row.try_get("ts")?,
            source: row.try_get("source")?,
            topic: row.try_get("topic")?,
            payload: row.try_get("payload")?,
            snapshot: row.try_get("snapshot")?,
            partition_key: row.try_get("partition_key")?,
            publish_state,
            recorded_at: row.try_get("recorded_at")?,
            published_at: row.try_get("published_at")?,
        })
    }
}
