//! Postgres pools and migrations.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Connect with a short linear backoff. The database is often still
/// starting when the worker comes up.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let mut attempt = 1;
    loop {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
        {
            Ok(pool) => {
                info!(max_connections, "Connected to database");
                return Ok(pool);
            }
            Err(e) if attempt >= CONNECT_ATTEMPTS => {
                return Err(e).context("Failed to connect to database");
            }
            Err(e) => {
                let backoff = CONNECT_BACKOFF * attempt;
                warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Database connect failed, retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Pool for the channel tables. Shares the event store pool when both live
/// in the same database.
pub async fn connect_channel(store_pool: &PgPool, store_url: &str, channel_url: &str) -> Result<PgPool> {
    if channel_url == store_url {
        return Ok(store_pool.clone());
    }
    let pool = connect(channel_url, 5).await?;
    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;
    info!("Migrations complete");
    Ok(())
}
