//! The storage seam under producers and consumers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// One record in a topic partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub ts: DateTime<Utc>,
}

/// Where an appended record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Offset bounds of a partition. `low` is the earliest retained offset,
/// `high` the offset the next append will get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: i64,
    pub high: i64,
}

/// Durable partitioned log with consumer-group offsets.
///
/// Offsets are dense per partition and start at 0. Committed offsets follow
/// the usual convention: the stored value is the next offset to read.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Round trip to the backing store.
    async fn ping(&self) -> Result<()>;

    /// Partition count of `topic`, creating the topic on first use.
    async fn partitions(&self, topic: &str) -> Result<i32>;

    /// Append one record to a partition.
    async fn append(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&str>,
        value: &[u8],
    ) -> Result<RecordMetadata>;

    /// Up to `max` records of a partition starting at `from_offset`, in order.
    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        from_offset: i64,
        max: usize,
    ) -> Result<Vec<Message>>;

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<Watermarks>;

    /// Next offset to read for a group, if it ever committed one.
    async fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Result<Option<i64>>;

    async fn commit(
        &self,
        group_id: &str,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<()>;
}
