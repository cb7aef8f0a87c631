//! Storefront event model and append-only event store.
//!
//! `Event` is the canonical document exchanged over the message channel.
//! `StoredEvent` is the storage record: the same event plus the bookkeeping
//! the store needs (sequence, partition key, publish state).

pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::EventStore;
pub use types::{Event, PublishIntent, PublishState, Recorded, StoredEvent};
