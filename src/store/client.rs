use super::StoreError;
use crate::models::{BulkItemError, DocumentUpdate, EmailDocument};
use async_trait::async_trait;
use std::collections::HashMap;

/// Visibility requested from a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Refresh {
    /// Return as soon as the store accepted the write.
    #[default]
    None,
    /// Return only once the write is visible to searches.
    WaitFor,
}

impl Refresh {
    pub fn as_query(&self) -> Option<&'static str> {
        match self {
            Refresh::None => None,
            Refresh::WaitFor => Some("wait_for"),
        }
    }
}

/// Per-item result of a bulk request, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Applied,
    Rejected(BulkItemError),
}

impl ItemOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ItemOutcome::Applied)
    }
}

/// Idempotent-by-id document store.
///
/// Every write keyed by a document id overwrites whatever is stored under that
/// id. A request-level failure is reported as `Err`; item-level rejections
/// inside an accepted bulk request come back as [`ItemOutcome::Rejected`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create the index and its mappings if they do not exist yet.
    async fn ensure_index(&self) -> Result<(), StoreError>;

    async fn upsert(&self, document: &EmailDocument, refresh: Refresh) -> Result<(), StoreError>;

    /// Upsert every document in one request. The returned outcomes line up with
    /// `documents` by position.
    async fn bulk_upsert(
        &self,
        documents: &[EmailDocument],
        refresh: Refresh,
    ) -> Result<Vec<ItemOutcome>, StoreError>;

    async fn update_fields(
        &self,
        id: &str,
        update: &DocumentUpdate,
        refresh: Refresh,
    ) -> Result<(), StoreError>;

    /// Delete one document. Deleting an unknown id succeeds.
    async fn delete(&self, id: &str, refresh: Refresh) -> Result<(), StoreError>;

    async fn bulk_delete(&self, ids: &[String], refresh: Refresh) -> Result<(), StoreError>;

    async fn exists(&self, id: &str) -> Result<bool, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    async fn size_in_bytes(&self) -> Result<u64, StoreError>;

    /// Document counts grouped by classification label.
    async fn category_counts(&self) -> Result<HashMap<String, u64>, StoreError>;
}
