use super::client::{DocumentStore, ItemOutcome, Refresh};
use super::error::StoreError;
use crate::models::{BulkItemError, DocumentUpdate, EmailDocument};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// In-process [`DocumentStore`] keyed by document id.
///
/// Besides serving local runs without Elasticsearch, it records every bulk
/// call and can be told to fail, which the indexer tests lean on.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    documents: HashMap<String, EmailDocument>,
    bulk_calls: Vec<Vec<String>>,
    failing_bulk_calls: usize,
    failing_writes: usize,
    rejected_positions: HashSet<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` bulk requests as a whole.
    pub fn fail_next_bulk(&self, count: usize) {
        self.state.lock().failing_bulk_calls = count;
    }

    /// Fail the next `count` single-document writes (upsert, update, delete).
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }

    /// Reject the items at these 0-based positions in every subsequent bulk upsert.
    pub fn reject_positions(&self, positions: impl IntoIterator<Item = usize>) {
        self.state.lock().rejected_positions = positions.into_iter().collect();
    }

    pub fn get(&self, id: &str) -> Option<EmailDocument> {
        self.state.lock().documents.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids carried by each bulk upsert that reached the store, in call order.
    pub fn bulk_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().bulk_calls.clone()
    }

    fn take_write_failure(state: &mut MemoryState) -> Result<(), StoreError> {
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

fn rejection() -> BulkItemError {
    BulkItemError {
        status: 400,
        kind: "mapper_parsing_exception".to_string(),
        reason: "injected rejection".to_string(),
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ensure_index(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert(&self, document: &EmailDocument, _refresh: Refresh) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        Self::take_write_failure(&mut state)?;
        state
            .documents
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        documents: &[EmailDocument],
        _refresh: Refresh,
    ) -> Result<Vec<ItemOutcome>, StoreError> {
        let mut state = self.state.lock();

        if state.failing_bulk_calls > 0 {
            state.failing_bulk_calls -= 1;
            return Err(StoreError::Unavailable("injected bulk failure".to_string()));
        }

        state
            .bulk_calls
            .push(documents.iter().map(|doc| doc.id.clone()).collect());

        let mut outcomes = Vec::with_capacity(documents.len());
        for (position, document) in documents.iter().enumerate() {
            if state.rejected_positions.contains(&position) {
                outcomes.push(ItemOutcome::Rejected(rejection()));
                continue;
            }

            state
                .documents
                .insert(document.id.clone(), document.clone());
            outcomes.push(ItemOutcome::Applied);
        }

        Ok(outcomes)
    }

    async fn update_fields(
        &self,
        id: &str,
        update: &DocumentUpdate,
        _refresh: Refresh,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        Self::take_write_failure(&mut state)?;
        match state.documents.get_mut(id) {
            Some(document) => {
                update.apply_to(document);
                Ok(())
            }
            None => Err(StoreError::status(
                reqwest::StatusCode::NOT_FOUND,
                format!("document {id} not found"),
            )),
        }
    }

    async fn delete(&self, id: &str, _refresh: Refresh) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        Self::take_write_failure(&mut state)?;
        state.documents.remove(id);
        Ok(())
    }

    async fn bulk_delete(&self, ids: &[String], _refresh: Refresh) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        Self::take_write_failure(&mut state)?;
        for id in ids {
            state.documents.remove(id);
        }
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().documents.contains_key(id))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().documents.len() as u64)
    }

    async fn size_in_bytes(&self) -> Result<u64, StoreError> {
        let state = self.state.lock();
        let mut total = 0u64;
        for document in state.documents.values() {
            total += serde_json::to_vec(document)?.len() as u64;
        }
        Ok(total)
    }

    async fn category_counts(&self) -> Result<HashMap<String, u64>, StoreError> {
        let state = self.state.lock();
        let mut counts = HashMap::new();
        for document in state.documents.values() {
            *counts
                .entry(document.ai_category.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;
    use chrono::Utc;

    fn document(id: &str, category: Category) -> EmailDocument {
        EmailDocument {
            id: id.to_string(),
            account_id: "account-1".into(),
            folder: "INBOX".into(),
            subject: format!("subject {id}"),
            body: "body".into(),
            from: "sender@example.com".into(),
            to: vec!["me@example.com".into()],
            cc: None,
            date: Utc::now(),
            ai_category: category,
            indexed_at: Utc::now(),
            has_attachments: false,
            flags: vec![],
        }
    }

    #[tokio::test]
    async fn upserting_the_same_id_overwrites() {
        let store = MemoryStore::new();
        let mut doc = document("a", Category::Uncategorized);
        store.upsert(&doc, Refresh::None).await.unwrap();
        doc.subject = "changed".into();
        store.bulk_upsert(&[doc.clone()], Refresh::None).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().subject, "changed");
    }

    #[tokio::test]
    async fn injected_failures_and_rejections() {
        let store = MemoryStore::new();
        let docs: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| document(id, Category::Spam))
            .collect();

        store.fail_next_bulk(1);
        assert!(store.bulk_upsert(&docs, Refresh::None).await.is_err());
        assert!(store.bulk_calls().is_empty());

        store.reject_positions([1]);
        let outcomes = store.bulk_upsert(&docs, Refresh::None).await.unwrap();
        assert!(outcomes[0].is_applied());
        assert!(!outcomes[1].is_applied());
        assert!(outcomes[2].is_applied());
        assert!(!store.exists("b").await.unwrap());
        assert_eq!(store.bulk_calls(), vec![vec!["a".to_string(), "b".into(), "c".into()]]);
    }

    #[tokio::test]
    async fn deletes_are_idempotent_and_counts_group_by_category() {
        let store = MemoryStore::new();
        store
            .bulk_upsert(
                &[
                    document("a", Category::Spam),
                    document("b", Category::Spam),
                    document("c", Category::Interested),
                ],
                Refresh::None,
            )
            .await
            .unwrap();

        store.delete("missing", Refresh::None).await.unwrap();
        store.delete("c", Refresh::None).await.unwrap();
        store.delete("c", Refresh::None).await.unwrap();

        let counts = store.category_counts().await.unwrap();
        assert_eq!(counts.get("Spam"), Some(&2));
        assert_eq!(counts.get("Interested"), None);
        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.size_in_bytes().await.unwrap() > 0);
    }
}
