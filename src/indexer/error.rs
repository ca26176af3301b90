use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by the batch indexer.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("bulk response carried {actual} items for {expected} documents")]
    ItemCountMismatch { expected: usize, actual: usize },
}
