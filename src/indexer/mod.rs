//! Write-optimised ingestion into the document store: size/time triggered
//! batching plus the direct, retried write paths.

pub mod batch;
pub mod error;

pub use batch::BatchIndexer;
pub use error::IndexError;
pub use crate::config::IndexerConfig;
