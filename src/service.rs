//! Wiring of the long-running ingestion tasks and their shutdown order.

use crate::config::AppConfig;
use crate::health::HealthMonitor;
use crate::indexer::BatchIndexer;
use crate::models::MailAccount;
use crate::pipeline::{IngestPipeline, PipelineStats};
use crate::store::{DocumentStore, ElasticsearchStore, MemoryStore, StoreBackend, StoreError};
use crate::supervisor::{ConnectionSupervisor, SessionConnector, SupervisorError, SupervisorEvent};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Build the configured store, wait for it to answer and make sure the index
/// exists.
pub async fn connect_store(config: &AppConfig) -> Result<Arc<dyn DocumentStore>, StoreError> {
    let store: Arc<dyn DocumentStore> = match config.store.backend {
        StoreBackend::Elasticsearch => {
            let store = ElasticsearchStore::new(&config.store)?;
            config
                .retry
                .run("cluster healthcheck", || store.healthcheck())
                .await?;
            info!(
                "using Elasticsearch at {} (index `{}`)",
                config.store.base_url,
                store.index()
            );
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("using in-memory document store; nothing is persisted");
            Arc::new(MemoryStore::new())
        }
    };

    config
        .retry
        .run("ensure index", || store.ensure_index())
        .await?;
    Ok(store)
}

#[derive(Default)]
struct RunningTasks {
    health: Option<JoinHandle<()>>,
    pipeline: Option<JoinHandle<PipelineStats>>,
}

/// Owns the supervisor, indexer and health monitor of one running service.
pub struct IngestService {
    supervisor: ConnectionSupervisor,
    indexer: BatchIndexer,
    health: HealthMonitor,
    accounts: Vec<MailAccount>,
    events: Mutex<Option<UnboundedReceiver<SupervisorEvent>>>,
    tasks: Mutex<RunningTasks>,
    health_shutdown: CancellationToken,
    pipeline_shutdown: CancellationToken,
}

impl IngestService {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn DocumentStore>,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        let indexer = BatchIndexer::new(store, config.indexer.clone(), config.retry.clone());
        let (supervisor, events) = ConnectionSupervisor::new(connector, config.supervisor.clone());
        let health = HealthMonitor::new(supervisor.clone(), config.health_check_interval);

        Self {
            supervisor,
            indexer,
            health,
            accounts: config.accounts.clone(),
            events: Mutex::new(Some(events)),
            tasks: Mutex::new(RunningTasks::default()),
            health_shutdown: CancellationToken::new(),
            pipeline_shutdown: CancellationToken::new(),
        }
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn indexer(&self) -> &BatchIndexer {
        &self.indexer
    }

    /// Start the pipeline and health monitor, then register every configured
    /// account. Calling it a second time does nothing.
    pub fn start(&self) -> Result<usize, SupervisorError> {
        let Some(events) = self.events.lock().take() else {
            warn!("ingest service already started");
            return Ok(0);
        };

        {
            let mut tasks = self.tasks.lock();
            let pipeline = IngestPipeline::new(events, self.indexer.clone());
            tasks.pipeline = Some(tokio::spawn(pipeline.run(self.pipeline_shutdown.clone())));
            tasks.health = Some(self.health.clone().spawn(self.health_shutdown.clone()));
        }

        self.supervisor.initialize_accounts(self.accounts.iter().cloned())
    }

    /// Stop in dependency order: health monitor, supervisor, pipeline drain,
    /// then the final flush of the indexer.
    pub async fn stop(&self) {
        info!("stopping ingest service");
        let (health, pipeline) = {
            let mut tasks = self.tasks.lock();
            (tasks.health.take(), tasks.pipeline.take())
        };

        self.health_shutdown.cancel();
        if let Some(handle) = health {
            let _ = handle.await;
        }

        self.supervisor.shutdown().await;

        self.pipeline_shutdown.cancel();
        if let Some(handle) = pipeline {
            match handle.await {
                Ok(stats) => info!(
                    "pipeline drained after {} documents",
                    stats.documents
                ),
                Err(err) => error!("ingest pipeline task failed: {}", err),
            }
        }

        if let Err(err) = self.indexer.shutdown().await {
            error!("final flush failed, buffered documents were not written: {}", err);
        }
        info!("ingest service stopped");
    }
}
