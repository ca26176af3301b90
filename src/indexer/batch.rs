use super::error::IndexError;
use crate::config::IndexerConfig;
use crate::models::{
    BulkFailure, BulkIndexResult, Category, DocumentUpdate, EmailDocument, IndexStats,
    format_bytes,
};
use crate::retry::RetryPolicy;
use crate::store::{DocumentStore, ItemOutcome, Refresh};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::mem;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Buffers documents and commits them to the store in bulk.
///
/// A batch is flushed as soon as it reaches `batch_size`, or `flush_delay`
/// after the most recent arrival. Every new arrival pushes the timed flush
/// back, so a steady trickle below `batch_size` keeps postponing it.
#[derive(Clone)]
pub struct BatchIndexer {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    config: IndexerConfig,
    retry: RetryPolicy,
    pending: Mutex<PendingState>,
    tracker: TaskTracker,
}

#[derive(Default)]
struct PendingState {
    batch: Vec<EmailDocument>,
    timer: Option<FlushTimer>,
    next_timer_id: u64,
}

struct FlushTimer {
    id: u64,
    token: CancellationToken,
}

impl PendingState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.token.cancel();
        }
    }
}

impl BatchIndexer {
    pub fn new(store: Arc<dyn DocumentStore>, config: IndexerConfig, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                retry,
                pending: Mutex::new(PendingState::default()),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Queue `document` for the next bulk write.
    ///
    /// Reaching `batch_size` flushes before this returns. A flush that fails
    /// after retries puts its documents back in the queue; they go out with the
    /// next flush triggered by a later arrival or by [`shutdown`](Self::shutdown).
    pub async fn index_email(&self, document: EmailDocument) {
        let ready = {
            let mut pending = self.inner.pending.lock();
            pending.batch.push(document);

            if pending.batch.len() >= self.inner.config.batch_size {
                pending.cancel_timer();
                Some(mem::take(&mut pending.batch))
            } else {
                self.arm_timer(&mut pending);
                None
            }
        };

        if let Some(batch) = ready {
            debug!("indexer: batch size {} reached", batch.len());
            let _ = self.inner.tracker.track_future(self.flush(batch)).await;
        }
    }

    /// Write one document and wait until it is searchable.
    pub async fn index_email_immediate(&self, document: &EmailDocument) -> Result<(), IndexError> {
        self.inner
            .retry
            .run("index immediate", || {
                self.inner.store.upsert(document, Refresh::WaitFor)
            })
            .await?;

        info!("indexer: indexed {} immediately", document.id);
        Ok(())
    }

    /// Upsert `documents` in a single bulk request.
    ///
    /// Item-level rejections are counted in the result and mapped back to the
    /// document at the same position. A failure of the request as a whole is
    /// returned as `Err` once retries are spent.
    pub async fn bulk_index_emails(
        &self,
        documents: &[EmailDocument],
    ) -> Result<BulkIndexResult, IndexError> {
        if documents.is_empty() {
            return Ok(BulkIndexResult::default());
        }

        let outcomes = self
            .inner
            .retry
            .run("bulk index", || {
                self.inner.store.bulk_upsert(documents, Refresh::WaitFor)
            })
            .await?;

        if outcomes.len() != documents.len() {
            return Err(IndexError::ItemCountMismatch {
                expected: documents.len(),
                actual: outcomes.len(),
            });
        }

        let mut result = BulkIndexResult::default();
        for (document, outcome) in documents.iter().zip(outcomes) {
            match outcome {
                ItemOutcome::Applied => result.success += 1,
                ItemOutcome::Rejected(error) => {
                    result.failed += 1;
                    result.errors.push(BulkFailure {
                        email_id: document.id.clone(),
                        error,
                    });
                }
            }
        }

        info!(
            "indexer: bulk indexed {} emails, {} failed",
            result.success, result.failed
        );
        Ok(result)
    }

    pub async fn update_email_category(&self, id: &str, category: Category) -> Result<(), IndexError> {
        self.update_email(id, &DocumentUpdate::category(category)).await
    }

    pub async fn update_email(&self, id: &str, update: &DocumentUpdate) -> Result<(), IndexError> {
        if update.is_empty() {
            debug!("indexer: empty update for {id}, nothing to write");
            return Ok(());
        }

        self.inner
            .retry
            .run("update email", || {
                self.inner.store.update_fields(id, update, Refresh::WaitFor)
            })
            .await?;

        info!("indexer: updated {id}");
        Ok(())
    }

    pub async fn delete_email(&self, id: &str) -> Result<(), IndexError> {
        self.inner
            .retry
            .run("delete email", || self.inner.store.delete(id, Refresh::WaitFor))
            .await?;

        info!("indexer: deleted {id}");
        Ok(())
    }

    pub async fn bulk_delete_emails(&self, ids: &[String]) -> Result<(), IndexError> {
        if ids.is_empty() {
            return Ok(());
        }

        self.inner
            .retry
            .run("bulk delete", || {
                self.inner.store.bulk_delete(ids, Refresh::WaitFor)
            })
            .await?;

        info!("indexer: deleted {} emails", ids.len());
        Ok(())
    }

    pub async fn email_exists(&self, id: &str) -> Result<bool, IndexError> {
        Ok(self.inner.store.exists(id).await?)
    }

    pub async fn get_index_stats(&self) -> Result<IndexStats, IndexError> {
        let store = &self.inner.store;
        let (total_emails, size_bytes, category_counts) =
            tokio::try_join!(store.count(), store.size_in_bytes(), store.category_counts())?;

        Ok(IndexStats {
            total_emails,
            index_size: format_bytes(size_bytes),
            index_size_bytes: size_bytes,
            category_counts,
        })
    }

    pub fn batch_queue_size(&self) -> usize {
        self.inner.pending.lock().batch.len()
    }

    /// Cancel the flush timer, wait for in-flight flushes, then flush whatever
    /// is still queued. Returns the final flush error, if any, with the
    /// documents left in the queue.
    pub async fn shutdown(&self) -> Result<(), IndexError> {
        info!("indexer: shutting down");
        self.inner.pending.lock().cancel_timer();

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let batch = {
            let mut pending = self.inner.pending.lock();
            pending.cancel_timer();
            mem::take(&mut pending.batch)
        };

        if !batch.is_empty() {
            self.flush(batch).await?;
        }

        info!("indexer: shutdown complete");
        Ok(())
    }

    fn arm_timer(&self, pending: &mut PendingState) {
        pending.cancel_timer();

        let id = pending.next_timer_id;
        pending.next_timer_id = pending.next_timer_id.wrapping_add(1);
        let token = CancellationToken::new();
        pending.timer = Some(FlushTimer {
            id,
            token: token.clone(),
        });

        let indexer = self.clone();
        let delay = self.inner.config.flush_delay;
        self.inner.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(delay) => indexer.flush_from_timer(id).await,
            }
        });
    }

    async fn flush_from_timer(&self, id: u64) {
        let batch = {
            let mut pending = self.inner.pending.lock();
            match pending.timer {
                Some(ref timer) if timer.id == id => {}
                // superseded or cancelled while waking up
                _ => return,
            }
            pending.timer = None;
            mem::take(&mut pending.batch)
        };

        debug!("indexer: flush delay elapsed with {} queued", batch.len());
        let _ = self.flush(batch).await;
    }

    async fn flush(&self, batch: Vec<EmailDocument>) -> Result<BulkIndexResult, IndexError> {
        if batch.is_empty() {
            return Ok(BulkIndexResult::default());
        }

        info!("indexer: flushing batch of {} emails", batch.len());
        match self.bulk_index_emails(&batch).await {
            Ok(result) => {
                for failure in &result.errors {
                    warn!(
                        "indexer: store rejected {}: {}",
                        failure.email_id, failure.error
                    );
                }
                Ok(result)
            }
            Err(err) => {
                error!(
                    "indexer: failed to flush batch of {}: {}; requeueing",
                    batch.len(),
                    err
                );
                self.requeue(batch);
                Err(err)
            }
        }
    }

    /// Put a failed batch back ahead of anything queued since it was taken.
    fn requeue(&self, mut batch: Vec<EmailDocument>) {
        let mut pending = self.inner.pending.lock();
        batch.append(&mut pending.batch);
        pending.batch = batch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    fn doc(id: &str) -> EmailDocument {
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
            ai_category: Category::Uncategorized,
            indexed_at: Utc::now(),
            has_attachments: false,
            flags: vec![],
        }
    }

    fn indexer(store: &Arc<MemoryStore>, batch_size: usize, retry: RetryPolicy) -> BatchIndexer {
        BatchIndexer::new(
            store.clone(),
            IndexerConfig {
                batch_size,
                flush_delay: Duration::from_millis(5_000),
            },
            retry,
        )
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    /// Holds every bulk upsert until a permit is added to `gate`, and can
    /// drop the last outcome of each response.
    struct GatedStore {
        inner: MemoryStore,
        gate: Semaphore,
        entered: Notify,
        short_responses: AtomicBool,
    }

    impl GatedStore {
        fn closed() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                gate: Semaphore::new(0),
                entered: Notify::new(),
                short_responses: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl DocumentStore for GatedStore {
        async fn ensure_index(&self) -> Result<(), StoreError> {
            self.inner.ensure_index().await
        }

        async fn upsert(&self, document: &EmailDocument, refresh: Refresh) -> Result<(), StoreError> {
            self.inner.upsert(document, refresh).await
        }

        async fn bulk_upsert(
            &self,
            documents: &[EmailDocument],
            refresh: Refresh,
        ) -> Result<Vec<ItemOutcome>, StoreError> {
            self.entered.notify_one();
            self.gate.acquire().await.unwrap().forget();

            let mut outcomes = self.inner.bulk_upsert(documents, refresh).await?;
            if self.short_responses.load(Ordering::SeqCst) {
                outcomes.pop();
            }
            Ok(outcomes)
        }

        async fn update_fields(
            &self,
            id: &str,
            update: &DocumentUpdate,
            refresh: Refresh,
        ) -> Result<(), StoreError> {
            self.inner.update_fields(id, update, refresh).await
        }

        async fn delete(&self, id: &str, refresh: Refresh) -> Result<(), StoreError> {
            self.inner.delete(id, refresh).await
        }

        async fn bulk_delete(&self, ids: &[String], refresh: Refresh) -> Result<(), StoreError> {
            self.inner.bulk_delete(ids, refresh).await
        }

        async fn exists(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.exists(id).await
        }

        async fn count(&self) -> Result<u64, StoreError> {
            self.inner.count().await
        }

        async fn size_in_bytes(&self) -> Result<u64, StoreError> {
            self.inner.size_in_bytes().await
        }

        async fn category_counts(&self) -> Result<HashMap<String, u64>, StoreError> {
            self.inner.category_counts().await
        }
    }

    fn gated_indexer(store: &Arc<GatedStore>, batch_size: usize) -> BatchIndexer {
        BatchIndexer::new(
            store.clone(),
            IndexerConfig {
                batch_size,
                flush_delay: Duration::from_secs(600),
            },
            RetryPolicy::no_retry(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_once_without_timer() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(&store, 50, RetryPolicy::no_retry());

        for n in 0..50 {
            indexer.index_email(doc(&format!("d{n}"))).await;
        }

        let calls = store.bulk_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 50);
        assert_eq!(indexer.batch_queue_size(), 0);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(store.bulk_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_after_delay() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(&store, 5, RetryPolicy::no_retry());

        indexer.index_email(doc("a")).await;
        indexer.index_email(doc("b")).await;
        assert!(store.bulk_calls().is_empty());
        assert_eq!(indexer.batch_queue_size(), 2);

        sleep(Duration::from_millis(5_001)).await;
        assert_eq!(store.bulk_calls(), vec![ids(&["a", "b"])]);
        assert_eq!(indexer.batch_queue_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn each_arrival_pushes_the_flush_back() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(&store, 5, RetryPolicy::no_retry());

        indexer.index_email(doc("a")).await;
        sleep(Duration::from_secs(3)).await;
        indexer.index_email(doc("b")).await;
        sleep(Duration::from_secs(3)).await;
        assert!(store.bulk_calls().is_empty());

        sleep(Duration::from_millis(2_001)).await;
        assert_eq!(store.bulk_calls(), vec![ids(&["a", "b"])]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_requeues_without_rearming() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(&store, 3, RetryPolicy::no_retry());
        store.fail_next_bulk(1);

        for id in ["a", "b", "c"] {
            indexer.index_email(doc(id)).await;
        }
        assert_eq!(indexer.batch_queue_size(), 3);

        sleep(Duration::from_secs(60)).await;
        assert!(store.bulk_calls().is_empty());
        assert_eq!(indexer.batch_queue_size(), 3);

        indexer.index_email(doc("d")).await;
        assert_eq!(store.bulk_calls(), vec![ids(&["a", "b", "c", "d"])]);
        assert_eq!(indexer.batch_queue_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_flush_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(&store, 2, RetryPolicy::default());
        store.fail_next_bulk(2);

        indexer.index_email(doc("a")).await;
        indexer.index_email(doc("b")).await;

        assert_eq!(store.bulk_calls().len(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(indexer.batch_queue_size(), 0);
    }

    #[tokio::test]
    async fn rejected_items_map_back_to_their_documents() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(&store, 50, RetryPolicy::no_retry());
        store.reject_positions([2, 5]);

        let docs: Vec<_> = (1..=7).map(|n| doc(&format!("d{n}"))).collect();
        let result = indexer.bulk_index_emails(&docs).await.unwrap();

        assert_eq!(result.success, 5);
        assert_eq!(result.failed, 2);
        let failed: Vec<_> = result.errors.iter().map(|f| f.email_id.as_str()).collect();
        assert_eq!(failed, vec!["d3", "d6"]);
        assert_eq!(result.errors[0].error.status, 400);
    }

    #[tokio::test]
    async fn empty_bulk_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(&store, 50, RetryPolicy::no_retry());

        let result = indexer.bulk_index_emails(&[]).await.unwrap();
        assert_eq!(result, BulkIndexResult::default());
        indexer.bulk_delete_emails(&[]).await.unwrap();
        assert!(store.bulk_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_and_cancels_timer() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(&store, 50, RetryPolicy::no_retry());

        for id in ["a", "b", "c"] {
            indexer.index_email(doc(id)).await;
        }
        indexer.shutdown().await.unwrap();

        assert_eq!(indexer.batch_queue_size(), 0);
        assert_eq!(store.bulk_calls(), vec![ids(&["a", "b", "c"])]);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(store.bulk_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_surfaces_final_flush_failure() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(&store, 50, RetryPolicy::no_retry());
        store.fail_next_bulk(1);

        indexer.index_email(doc("a")).await;
        indexer.index_email(doc("b")).await;

        assert!(indexer.shutdown().await.is_err());
        assert_eq!(indexer.batch_queue_size(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resubmitting_an_id_does_not_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(&store, 1, RetryPolicy::no_retry());

        let document = doc("same");
        indexer.index_email(document.clone()).await;
        indexer.index_email(document.clone()).await;
        indexer.index_email_immediate(&document).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("same"), Some(document));
        assert!(indexer.email_exists("same").await.unwrap());
    }

    #[tokio::test]
    async fn direct_writes_and_stats() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(&store, 50, RetryPolicy::no_retry());
        indexer
            .bulk_index_emails(&[doc("a"), doc("b"), doc("c")])
            .await
            .unwrap();

        indexer
            .update_email_category("a", Category::Interested)
            .await
            .unwrap();
        indexer.delete_email("c").await.unwrap();
        indexer.delete_email("c").await.unwrap();

        let stats = indexer.get_index_stats().await.unwrap();
        assert_eq!(stats.total_emails, 2);
        assert_eq!(stats.category_counts.get("Interested"), Some(&1));
        assert_eq!(stats.category_counts.get("Uncategorized"), Some(&1));
        assert_eq!(stats.index_size, format_bytes(stats.index_size_bytes));

        indexer
            .bulk_delete_emails(&ids(&["a", "b"]))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn direct_writes_retry_then_surface_errors() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(&store, 50, RetryPolicy::default());

        store.fail_next_writes(2);
        indexer.index_email_immediate(&doc("a")).await.unwrap();
        assert!(store.exists("a").await.unwrap());

        store.fail_next_writes(3);
        let err = indexer.delete_email("a").await.unwrap_err();
        assert!(matches!(err, IndexError::Store(_)));
        assert!(store.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn arrivals_during_a_failing_flush_queue_behind_the_requeued_batch() {
        let store = GatedStore::closed();
        let indexer = gated_indexer(&store, 2);
        store.inner.fail_next_bulk(1);

        indexer.index_email(doc("a")).await;
        let flushing = tokio::spawn({
            let indexer = indexer.clone();
            async move { indexer.index_email(doc("b")).await }
        });
        store.entered.notified().await;
        assert_eq!(indexer.batch_queue_size(), 0);

        indexer.index_email(doc("c")).await;
        assert_eq!(indexer.batch_queue_size(), 1);

        store.gate.add_permits(1);
        flushing.await.unwrap();
        assert_eq!(indexer.batch_queue_size(), 3);
        assert!(store.inner.bulk_calls().is_empty());

        store.gate.add_permits(1);
        indexer.shutdown().await.unwrap();
        assert_eq!(store.inner.bulk_calls(), vec![ids(&["a", "b", "c"])]);
        assert_eq!(indexer.batch_queue_size(), 0);
    }

    #[tokio::test]
    async fn short_bulk_response_fails_and_requeues_the_batch() {
        let store = GatedStore::closed();
        let indexer = gated_indexer(&store, 2);
        store.gate.add_permits(10);
        store.short_responses.store(true, Ordering::SeqCst);

        let err = indexer
            .bulk_index_emails(&[doc("x"), doc("y")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IndexError::ItemCountMismatch {
                expected: 2,
                actual: 1
            }
        ));

        indexer.index_email(doc("a")).await;
        indexer.index_email(doc("b")).await;
        assert_eq!(indexer.batch_queue_size(), 2);

        store.short_responses.store(false, Ordering::SeqCst);
        indexer.shutdown().await.unwrap();
        assert_eq!(indexer.batch_queue_size(), 0);
        assert_eq!(store.inner.bulk_calls().last(), Some(&ids(&["a", "b"])));
    }
}
