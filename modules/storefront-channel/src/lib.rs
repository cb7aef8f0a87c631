//! Message channel: a durable, partitioned log with consumer-group offsets,
//! plus the producer and consumer runtimes that sit on top of it.
//!
//! `MessageLog` is the storage seam. `PgMessageLog` backs it with Postgres;
//! `MemoryMessageLog` keeps everything in process for tests and can simulate
//! outages.

pub mod consumer;
pub mod error;
pub mod handler;
pub mod log;
pub mod memory;
pub mod partition;
pub mod pg;
pub mod policy;
pub mod producer;
pub mod state;

pub use consumer::{Consumer, LoopExit};
pub use error::{ChannelError, Result};
pub use handler::{HandlerError, HandlerOutcome, MessageHandler};
pub use log::{Message, MessageLog, RecordMetadata, Watermarks};
pub use memory::MemoryMessageLog;
pub use pg::PgMessageLog;
pub use policy::{DeliveryPolicy, FailurePolicy, RetryPolicy, StartFrom};
pub use producer::Producer;
pub use state::ConnectionState;
