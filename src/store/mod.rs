//! Document store clients: the idempotent-by-id contract plus its HTTP and
//! in-process implementations.

pub mod client;
pub mod config;
pub mod elasticsearch;
pub mod error;
pub mod memory;

pub use client::{DocumentStore, ItemOutcome, Refresh};
pub use config::{StoreBackend, StoreConfig};
pub use elasticsearch::ElasticsearchStore;
pub use error::StoreError;
pub use memory::MemoryStore;
