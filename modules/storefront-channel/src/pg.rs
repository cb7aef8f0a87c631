//! PgMessageLog: the message channel backed by Postgres.
//!
//! Each append bumps `channel_partitions.next_offset` and inserts the record
//! in the same transaction. The row lock serializes writers per partition, so
//! offsets commit in order and readers never observe a hole.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::error::{ChannelError, Result};
use crate::log::{Message, MessageLog, RecordMetadata, Watermarks};

#[derive(Clone)]
struct Topic {
    partitions: i32,
}

pub struct PgMessageLog {
    pool: PgPool,
    default_partitions: i32,
    // Partition counts never change after creation, so they are cached.
    topics: Mutex<HashMap<String, Topic>>,
}

impl PgMessageLog {
    pub fn new(pool: PgPool, default_partitions: i32) -> Self {
        Self {
            pool,
            default_partitions: default_partitions.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, topic: &str) -> Option<Topic> {
        self.topics.lock().ok()?.get(topic).cloned()
    }

    async fn ensure_topic(&self, topic: &str) -> Result<Topic> {
        if let Some(cached) = self.cached(topic) {
            return Ok(cached);
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO channel_topics (topic, partitions) VALUES ($1, $2) ON CONFLICT (topic) DO NOTHING",
        )
        .bind(topic)
        .bind(self.default_partitions)
        .execute(&mut *tx)
        .await?;

        let (partitions,) = sqlx::query_as::<_, (i32,)>(
            "SELECT partitions FROM channel_topics WHERE topic = $1",
        )
        .bind(topic)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO channel_partitions (topic, partition)
            SELECT $1, p FROM generate_series(0, $2 - 1) AS p
            ON CONFLICT (topic, partition) DO NOTHING
            "#,
        )
        .bind(topic)
        .bind(partitions)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(topic, partitions, "Topic ready");
        let entry = Topic { partitions };
        if let Ok(mut topics) = self.topics.lock() {
            topics.insert(topic.to_string(), entry.clone());
        }
        Ok(entry)
    }

    async fn check_partition(&self, topic: &str, partition: i32) -> Result<()> {
        let known = self.ensure_topic(topic).await?;
        if (0..known.partitions).contains(&partition) {
            Ok(())
        } else {
            Err(ChannelError::UnknownPartition {
                topic: topic.to_string(),
                partition,
                partitions: known.partitions,
            })
        }
    }
}

#[async_trait]
impl MessageLog for PgMessageLog {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn partitions(&self, topic: &str) -> Result<i32> {
        Ok(self.ensure_topic(topic).await?.partitions)
    }

    async fn append(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&str>,
        value: &[u8],
    ) -> Result<RecordMetadata> {
        self.check_partition(topic, partition).await?;

        let mut tx = self.pool.begin().await?;

        let (offset,) = sqlx::query_as::<_, (i64,)>(
            r#"
            UPDATE channel_partitions
            SET next_offset = next_offset + 1
            WHERE topic = $1 AND partition = $2
            RETURNING next_offset - 1
            "#,
        )
        .bind(topic)
        .bind(partition)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO channel_messages (topic, partition, "offset", key, value)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(topic)
        .bind(partition)
        .bind(offset)
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        notify_append(&self.pool, topic).await;

        Ok(RecordMetadata {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        from_offset: i64,
        max: usize,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT topic, partition, "offset", key, value, ts
            FROM channel_messages
            WHERE topic = $1 AND partition = $2 AND "offset" >= $3
            ORDER BY "offset" ASC
            LIMIT $4
            "#,
        )
        .bind(topic)
        .bind(partition)
        .bind(from_offset)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<Watermarks> {
        self.check_partition(topic, partition).await?;

        let (high, low) = sqlx::query_as::<_, (i64, Option<i64>)>(
            r#"
            SELECT p.next_offset,
                   (SELECT MIN(m."offset") FROM channel_messages m
                    WHERE m.topic = p.topic AND m.partition = p.partition)
            FROM channel_partitions p
            WHERE p.topic = $1 AND p.partition = $2
            "#,
        )
        .bind(topic)
        .bind(partition)
        .fetch_one(&self.pool)
        .await?;

        Ok(Watermarks {
            low: low.unwrap_or(high),
            high,
        })
    }

    async fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Result<Option<i64>> {
        let row = sqlx::query_as::<_, (i64,)>(
            r#"
            SELECT committed_offset FROM channel_offsets
            WHERE group_id = $1 AND topic = $2 AND partition = $3
            "#,
        )
        .bind(group_id)
        .bind(topic)
        .bind(partition)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.0))
    }

    async fn commit(
        &self,
        group_id: &str,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channel_offsets (group_id, topic, partition, committed_offset)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (group_id, topic, partition)
            DO UPDATE SET committed_offset = EXCLUDED.committed_offset, updated_at = now()
            "#,
        )
        .bind(group_id)
        .bind(topic)
        .bind(partition)
        .bind(next_offset)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rows and NOTIFY
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct MessageRow {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<String>,
    value: Vec<u8>,
    ts: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            topic: row.topic,
            partition: row.partition,
            offset: row.offset,
            key: row.key,
            value: row.value,
            ts: row.ts,
        }
    }
}

/// Best-effort nudge for listeners. Consumers poll regardless.
async fn notify_append(pool: &PgPool, topic: &str) {
    let result = sqlx::query("SELECT pg_notify('channel_messages', $1)")
        .bind(topic)
        .execute(pool)
        .await;

    if let Err(e) = result {
        warn!(error = %e, topic, "PG NOTIFY failed (non-fatal)");
    }
}
