//! `storefront-worker relay <kind>`: run one relay until a signal arrives or
//! the delivery loop gives up.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use storefront_channel::{
    Consumer, DeliveryPolicy, FailurePolicy, LoopExit, MessageLog, PgMessageLog, Producer,
    RetryPolicy, StartFrom,
};
use storefront_common::{RelayConfig, RelayKind};
use storefront_events::EventStore;
use storefront_relay::{
    relay_for, EventPersister, LogNotificationSender, PendingPublisher, RelayHandler, RelayRoute,
    SWEEP_LIMIT,
};
use tokio::signal;
use tracing::{error, info, warn};

use crate::db;

/// Retry schedule for the startup connects.
fn connect_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 10,
        initial_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(15),
        ..RetryPolicy::default()
    }
}

pub fn delivery_policy(config: &RelayConfig) -> DeliveryPolicy {
    let failure = if config.commit_on_failure {
        FailurePolicy::CommitAndContinue
    } else {
        FailurePolicy::Retry(RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            dead_letter_topic: config.dead_letter_topic.clone(),
            ..RetryPolicy::default()
        })
    };

    DeliveryPolicy {
        failure,
        start_from: if config.from_beginning {
            StartFrom::Earliest
        } else {
            StartFrom::Latest
        },
        ..DeliveryPolicy::default()
    }
}

pub async fn run(kind: RelayKind) -> Result<()> {
    let config = RelayConfig::from_env(kind)?;
    let service = kind.service_name();

    let pool = db::connect(&config.database_url, 5).await?;
    db::migrate(&pool).await?;
    let channel_pool =
        db::connect_channel(&pool, &config.database_url, &config.channel_database_url).await?;

    let store = EventStore::new(pool.clone());
    store.ping().await.context("Event store is not reachable")?;
    let persister: Arc<dyn EventPersister> = Arc::new(store);
    let log: Arc<dyn MessageLog> = Arc::new(PgMessageLog::new(channel_pool, config.partitions));

    let producer = Arc::new(Producer::new(
        format!("{}-producer", config.client_id),
        log.clone(),
    ));
    producer
        .connect_with_retry(&connect_policy())
        .await
        .context("Producer could not reach the channel")?;

    // Finish what a previous run recorded but never published.
    let sweeper = PendingPublisher::new(service, persister.clone(), producer.clone());
    match sweeper.sweep(SWEEP_LIMIT).await {
        Ok(0) => {}
        Ok(published) => info!(service, published, "Published events left pending"),
        Err(e) => warn!(service, error = %e, "Pending sweep failed, continuing"),
    }

    let handler = RelayHandler::new(
        relay_for(kind, Arc::new(LogNotificationSender)),
        RelayRoute::new(config.consume_topic.clone(), config.produce_topic.clone()),
        persister,
        producer.clone(),
        config.id_strategy,
    );

    let consumer = Consumer::new(config.client_id.clone(), log, delivery_policy(&config));
    connect_consumer(&consumer, &config.group_id).await?;
    consumer
        .subscribe(&config.consume_topic, Arc::new(handler))
        .await
        .context("Subscribe failed")?;

    info!(
        service,
        consume = %config.consume_topic,
        produce = %config.produce_topic,
        "Relay started"
    );

    let exit = tokio::select! {
        _ = shutdown_signal() => None,
        exit = consumer.closed() => Some(exit),
    };

    info!(service, "Shutting down");
    consumer.disconnect().await;
    producer.disconnect().await;
    pool.close().await;
    info!(service, "Channel and database connections closed");

    match exit {
        Some(LoopExit::Failed(e)) => Err(anyhow!("{service} delivery loop failed: {e}")),
        _ => Ok(()),
    }
}

async fn connect_consumer(consumer: &Consumer, group_id: &str) -> Result<()> {
    let policy = connect_policy();
    let mut attempt = 1;
    loop {
        match consumer.connect(group_id).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= policy.max_attempts => {
                return Err(e).context("Consumer could not reach the channel");
            }
            Err(e) => {
                let backoff = policy.backoff(attempt);
                warn!(attempt, group_id, error = %e, "Consumer connect failed, retrying after backoff");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
