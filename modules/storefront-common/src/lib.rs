pub mod config;
pub mod types;

pub use config::{RelayConfig, StoreConfig};
pub use types::*;
