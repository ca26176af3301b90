use crate::indexer::BatchIndexer;
use crate::supervisor::SupervisorEvent;
use log::{debug, error, info};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// Counters kept by [`IngestPipeline::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub documents: usize,
    pub ready: usize,
    pub failed: usize,
}

/// Routes supervisor events to the indexer and the log.
pub struct IngestPipeline {
    events: UnboundedReceiver<SupervisorEvent>,
    indexer: BatchIndexer,
}

impl IngestPipeline {
    pub fn new(events: UnboundedReceiver<SupervisorEvent>, indexer: BatchIndexer) -> Self {
        Self { events, indexer }
    }

    /// Consume events until the channel closes or `shutdown` fires. On
    /// shutdown, events already buffered are still handed to the indexer.
    pub async fn run(mut self, shutdown: CancellationToken) -> PipelineStats {
        info!("ingest pipeline started");
        let mut stats = PipelineStats::default();

        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event, &mut stats).await,
                    None => {
                        debug!("ingest pipeline: event channel closed");
                        break;
                    }
                },
                _ = shutdown.cancelled() => {
                    self.drain(&mut stats).await;
                    break;
                }
            }
        }

        info!(
            "ingest pipeline stopped: {} documents, {} ready, {} failed",
            stats.documents, stats.ready, stats.failed
        );
        stats
    }

    async fn drain(&mut self, stats: &mut PipelineStats) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.handle(event, stats).await,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    async fn handle(&self, event: SupervisorEvent, stats: &mut PipelineStats) {
        match event {
            SupervisorEvent::Document(document) => {
                debug!(
                    "ingest pipeline: queueing {} from {}",
                    document.id, document.account_id
                );
                stats.documents += 1;
                self.indexer.index_email(*document).await;
            }
            SupervisorEvent::Ready { account_id } => {
                stats.ready += 1;
                info!("ingest pipeline: {account_id} is live");
            }
            SupervisorEvent::Failed { account_id, cause } => {
                stats.failed += 1;
                error!("ingest pipeline: {account_id} permanently failed: {cause}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexerConfig;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;
    use crate::test_support::test_document;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn buffered_events_are_drained_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let indexer = BatchIndexer::new(
            store.clone(),
            IndexerConfig {
                batch_size: 10,
                flush_delay: Duration::from_secs(5),
            },
            RetryPolicy::no_retry(),
        );
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(SupervisorEvent::Ready {
            account_id: "account-1".into(),
        })
        .unwrap();
        for n in 0..3 {
            tx.send(SupervisorEvent::Document(Box::new(test_document(
                "account-1",
                &format!("m{n}"),
            ))))
            .unwrap();
        }
        tx.send(SupervisorEvent::Failed {
            account_id: "account-2".into(),
            cause: "bad password".into(),
        })
        .unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let stats = IngestPipeline::new(rx, indexer.clone()).run(shutdown).await;

        assert_eq!(
            stats,
            PipelineStats {
                documents: 3,
                ready: 1,
                failed: 1
            }
        );
        assert_eq!(indexer.batch_queue_size(), 3);
        indexer.shutdown().await.unwrap();
        assert_eq!(store.len(), 3);
    }
}
