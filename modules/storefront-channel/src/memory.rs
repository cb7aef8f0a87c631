//! In-process `MessageLog` for tests. No database required.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ChannelError, Result};
use crate::log::{Message, MessageLog, RecordMetadata, Watermarks};

#[derive(Default)]
struct Inner {
    topics: HashMap<String, i32>,
    partitions: HashMap<(String, i32), Vec<Message>>,
    offsets: HashMap<(String, String, i32), i64>,
}

/// Thread-safe in-memory log. Can simulate an outage (`set_available`) or a
/// number of rejected writes (`fail_next_appends`).
pub struct MemoryMessageLog {
    default_partitions: i32,
    inner: Mutex<Inner>,
    available: AtomicBool,
    failing_appends: AtomicU32,
}

impl MemoryMessageLog {
    pub fn new(default_partitions: i32) -> Self {
        Self {
            default_partitions: default_partitions.max(1),
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
            failing_appends: AtomicU32::new(0),
        }
    }

    /// Pre-create a topic with a specific partition count.
    pub fn with_topic(self, topic: &str, partitions: i32) -> Self {
        self.inner
            .lock()
            .unwrap()
            .topics
            .insert(topic.to_string(), partitions.max(1));
        self
    }

    /// While false, every operation fails with `ChannelError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Reject the next `n` appends.
    pub fn fail_next_appends(&self, n: u32) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Every record of a topic, partition by partition, in offset order.
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        let inner = self.inner.lock().unwrap();
        let partitions = inner.topics.get(topic).copied().unwrap_or(0);
        (0..partitions)
            .flat_map(|p| {
                inner
                    .partitions
                    .get(&(topic.to_string(), p))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChannelError::Unavailable("memory log is offline".into()))
        }
    }

    fn take_append_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn ensure_topic(&self, inner: &mut Inner, topic: &str) -> i32 {
        *inner
            .topics
            .entry(topic.to_string())
            .or_insert(self.default_partitions)
    }
}

fn check_partition(topic: &str, partition: i32, partitions: i32) -> Result<()> {
    if (0..partitions).contains(&partition) {
        Ok(())
    } else {
        Err(ChannelError::UnknownPartition {
            topic: topic.to_string(),
            partition,
            partitions,
        })
    }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn partitions(&self, topic: &str) -> Result<i32> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        Ok(self.ensure_topic(&mut inner, topic))
    }

    async fn append(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&str>,
        value: &[u8],
    ) -> Result<RecordMetadata> {
        self.check_available()?;
        if self.take_append_failure() {
            return Err(ChannelError::Publish {
                topic: topic.to_string(),
                reason: "simulated write rejection".into(),
            });
        }

        let mut inner = self.inner.lock().unwrap();
        let partitions = self.ensure_topic(&mut inner, topic);
        check_partition(topic, partition, partitions)?;

        let records = inner
            .partitions
            .entry((topic.to_string(), partition))
            .or_default();
        let offset = records.len() as i64;
        records.push(Message {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.map(str::to_string),
            value: value.to_vec(),
            ts: Utc::now(),
        });

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
        self.check_available()?;
        let inner = self.inner.lock().unwrap();
        let start = from_offset.max(0) as usize;
        Ok(inner
            .partitions
            .get(&(topic.to_string(), partition))
            .map(|records| records.iter().skip(start).take(max).cloned().collect())
            .unwrap_or_default())
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<Watermarks> {
        self.check_available()?;
        let inner = self.inner.lock().unwrap();
        let high = inner
            .partitions
            .get(&(topic.to_string(), partition))
            .map(|records| records.len() as i64)
            .unwrap_or(0);
        Ok(Watermarks { low: 0, high })
    }

    async fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Result<Option<i64>> {
        self.check_available()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .offsets
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied())
    }

    async fn commit(
        &self,
        group_id: &str,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        inner.offsets.insert(
            (group_id.to_string(), topic.to_string(), partition),
            next_offset,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offsets_are_dense_per_partition() {
        let log = MemoryMessageLog::new(2);

        let a = log.append("t", 0, Some("k"), b"a").await.unwrap();
        let b = log.append("t", 0, Some("k"), b"b").await.unwrap();
        let c = log.append("t", 1, None, b"c").await.unwrap();

        assert_eq!((a.offset, b.offset, c.offset), (0, 1, 0));
        assert_eq!(log.watermarks("t", 0).await.unwrap(), Watermarks { low: 0, high: 2 });

        let fetched = log.fetch("t", 0, 1, 10).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].value, b"b");
    }

    #[tokio::test]
    async fn rejects_unknown_partition() {
        let log = MemoryMessageLog::new(1).with_topic("t", 2);
        assert_eq!(log.partitions("t").await.unwrap(), 2);
        let err = log.append("t", 5, None, b"x").await.unwrap_err();
        assert!(matches!(err, ChannelError::UnknownPartition { partition: 5, .. }));
    }

    #[tokio::test]
    async fn outage_fails_every_operation() {
        let log = MemoryMessageLog::new(1);
        log.set_available(false);

        assert!(log.ping().await.is_err());
        assert!(log.append("t", 0, None, b"x").await.is_err());
        assert!(log.committed("g", "t", 0).await.is_err());

        log.set_available(true);
        assert!(log.ping().await.is_ok());
    }

    #[tokio::test]
    async fn injected_append_failures_are_consumed() {
        let log = MemoryMessageLog::new(1);
        log.fail_next_appends(1);

        assert!(log.append("t", 0, None, b"x").await.is_err());
        assert!(log.append("t", 0, None, b"x").await.is_ok());
        assert_eq!(log.messages("t").len(), 1);
    }

    #[tokio::test]
    async fn commits_are_per_group() {
        let log = MemoryMessageLog::new(1);
        log.commit("welcome", "t", 0, 3).await.unwrap();

        assert_eq!(log.committed("welcome", "t", 0).await.unwrap(), Some(3));
        assert_eq!(log.committed("audit", "t", 0).await.unwrap(), None);
    }
}
