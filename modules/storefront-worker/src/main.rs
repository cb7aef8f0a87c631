use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use storefront_common::RelayKind;
use tracing_subscriber::EnvFilter;

mod admin;
mod db;
mod relay;

#[derive(Parser)]
#[command(name = "storefront-worker", about = "Storefront event relays and event store tools")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a relay until SIGINT/SIGTERM
    Relay {
        /// welcome | notification
        kind: RelayKind,
    },

    /// Record and publish a new event
    Emit {
        /// Service name stamped on the event
        #[arg(long)]
        source: String,
        #[arg(long)]
        topic: String,
        /// Partition key
        #[arg(long)]
        key: Option<String>,
        /// Payload as a JSON document
        #[arg(long)]
        payload: String,
        /// Snapshot as a JSON document
        #[arg(long)]
        snapshot: Option<String>,
    },

    /// Apply database migrations
    Migrate,

    /// Print the causal chain of an event and what was derived from it
    Lineage {
        event_id: String,
    },

    /// Print recorded events of a topic
    Events {
        #[arg(long)]
        topic: String,
        /// Only events with a sequence number above this
        #[arg(long, default_value_t = 0)]
        after: i64,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Delete every event a source recorded
    Purge {
        #[arg(long)]
        source: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Relay { kind } => relay::run(kind).await,
        Command::Emit {
            source,
            topic,
            key,
            payload,
            snapshot,
        } => {
            let payload = serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let snapshot = snapshot
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("--snapshot is not valid JSON")?;
            admin::emit(&source, &topic, key.as_deref(), payload, snapshot).await
        }
        Command::Migrate => admin::migrate().await,
        Command::Lineage { event_id } => admin::lineage(&event_id).await,
        Command::Events { topic, after, limit } => admin::events(&topic, after, limit).await,
        Command::Purge { source } => admin::purge(&source).await,
    }
}
