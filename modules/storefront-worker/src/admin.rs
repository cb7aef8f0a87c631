//! One-shot commands against the event store and channel.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use storefront_channel::{PgMessageLog, Producer};
use storefront_common::StoreConfig;
use storefront_events::{EventStore, StoredEvent};
use storefront_relay::EventEmitter;
use tracing::info;

use crate::db;

async fn store_pool(config: &StoreConfig) -> Result<PgPool> {
    let pool = db::connect(&config.database_url, 2).await?;
    db::migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate() -> Result<()> {
    let config = StoreConfig::from_env()?;
    let pool = store_pool(&config).await?;
    if config.channel_database_url != config.database_url {
        db::connect_channel(&pool, &config.database_url, &config.channel_database_url).await?;
    }
    pool.close().await;
    Ok(())
}

pub async fn emit(
    source: &str,
    topic: &str,
    key: Option<&str>,
    payload: Value,
    snapshot: Option<Value>,
) -> Result<()> {
    let config = StoreConfig::from_env()?;
    let pool = store_pool(&config).await?;
    let channel_pool =
        db::connect_channel(&pool, &config.database_url, &config.channel_database_url).await?;

    let producer = Arc::new(Producer::new(
        format!("{source}-cli"),
        Arc::new(PgMessageLog::new(channel_pool, config.partitions)),
    ));
    producer.connect().await.context("Channel is not reachable")?;

    let emitter = EventEmitter::new(source, Arc::new(EventStore::new(pool.clone())), producer.clone());
    let result = emitter.create_and_publish(topic, key, payload, snapshot).await;
    producer.disconnect().await;

    let event = result?;
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

pub async fn lineage(event_id: &str) -> Result<()> {
    let config = StoreConfig::from_env()?;
    let store = EventStore::new(store_pool(&config).await?);

    let chain = store.read_lineage(event_id).await?;
    if chain.is_empty() {
        anyhow::bail!("No event with id {event_id}");
    }
    println!("Lineage of {event_id}:");
    for (depth, stored) in chain.iter().enumerate() {
        println!("{}{}", "  ".repeat(depth), describe(stored));
    }

    let derived = store.read_derived(event_id).await?;
    if !derived.is_empty() {
        println!("Derived from {event_id}:");
        for stored in &derived {
            println!("  {}", describe(stored));
        }
    }
    Ok(())
}

pub async fn events(topic: &str, after: i64, limit: usize) -> Result<()> {
    let config = StoreConfig::from_env()?;
    let store = EventStore::new(store_pool(&config).await?);

    for stored in store.read_by_topic(topic, after, limit).await? {
        println!("{}", serde_json::to_string(&stored)?);
    }
    Ok(())
}

pub async fn purge(source: &str) -> Result<()> {
    let config = StoreConfig::from_env()?;
    let store = EventStore::new(store_pool(&config).await?);

    let deleted = store.purge_source(source).await?;
    info!(source, deleted, "Purge complete");
    println!("Deleted {deleted} events recorded by {source}");
    Ok(())
}

fn describe(stored: &StoredEvent) -> String {
    let status = stored
        .snapshot
        .as_ref()
        .and_then(|s| s.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("-");
    format!(
        "#{} {} [{}] {} -> {} ({}, {})",
        stored.seq,
        stored.event_id,
        stored.publish_state.as_str(),
        stored.source,
        stored.topic,
        status,
        stored.ts.to_rfc3339()
    )
}
