//! Relational Bitcoin explorer: loads raw blocks into Postgres, rebuilds
//! transactions from stored rows, resolves output owners, joins prices and
//! streams new blocks and address changes to WebSocket subscribers.

pub mod assembler;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod explorer;
pub mod ingest;
pub mod models;
pub mod price;
pub mod rawblock;
pub mod script;
pub mod storage;

pub use config::{Config, Context};
pub use error::{Error, Result};
