//! Graph memory facade - wires the store, embedder and pipelines together

use crate::chunking::{RecursiveTextSplitter, TextSplitter};
use crate::config::MemoryConfig;
use crate::conversation::{ConversationWriter, WriteOutcome};
use crate::embedding::EmbeddingProvider;
use crate::error::{MemoryError, MemoryResult};
use crate::maintenance::{MaintenanceHandle, MaintenanceReport, MaintenanceScheduler, MaintenanceWorker};
use crate::model::Turn;
use crate::retrieval::{LinkBackWriter, RetrievedContext, Retriever};
use crate::schema::{SchemaManager, SchemaReport};
use crate::store::GraphStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Conversation memory backed by a graph store
pub struct GraphMemory {
    /// Storage backend
    store: Arc<dyn GraphStore>,

    /// Embedding backend
    embedder: Arc<dyn EmbeddingProvider>,

    /// Configuration
    config: MemoryConfig,

    writer: ConversationWriter,
    retriever: Retriever,
    link_back: LinkBackWriter,
    scheduler: Arc<MaintenanceScheduler>,
    worker: Mutex<Option<MaintenanceHandle>>,
    schema: SchemaReport,
}

impl GraphMemory {
    /// Validate the configuration, apply the schema and build the pipelines
    ///
    /// Schema statements that fail are logged and reported through
    /// [`GraphMemory::schema_report`]; they do not abort opening.
    pub async fn open(
        store: Arc<dyn GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: MemoryConfig,
    ) -> MemoryResult<Self> {
        config.validate()?;
        if embedder.dimensions() != config.embedding_dimensions {
            return Err(MemoryError::configuration(format!(
                "embedding provider '{}' yields {} dimensions, configuration expects {}",
                embedder.model_name(),
                embedder.dimensions(),
                config.embedding_dimensions
            )));
        }

        let splitter: Arc<dyn TextSplitter> =
            Arc::new(RecursiveTextSplitter::new(config.chunk_size, config.chunk_overlap)?);
        let schema = SchemaManager::new(store.clone(), config.embedding_dimensions)
            .apply()
            .await;

        info!(
            backend = store.backend_name(),
            model = embedder.model_name(),
            dimensions = config.embedding_dimensions,
            "graph memory opened"
        );

        Ok(Self {
            writer: ConversationWriter::new(
                store.clone(),
                config.retry.clone(),
                config.source_content_limit,
            ),
            retriever: Retriever::new(
                store.clone(),
                embedder.clone(),
                config.retrieval_top_k,
                config.similarity_threshold(),
            ),
            link_back: LinkBackWriter::new(store.clone(), config.retry.clone()),
            scheduler: Arc::new(MaintenanceScheduler::new(
                store.clone(),
                embedder.clone(),
                splitter,
                config.embedding_batch_size,
            )),
            worker: Mutex::new(None),
            store,
            embedder,
            config,
            schema,
        })
    }

    /// Connect to Neo4j with the given settings, then [`GraphMemory::open`]
    #[cfg(feature = "neo4j")]
    pub async fn connect_neo4j(
        settings: &crate::config::Neo4jConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        config: MemoryConfig,
    ) -> MemoryResult<Self> {
        let store = crate::store::Neo4jGraphStore::connect(settings).await?;
        Self::open(Arc::new(store), embedder, config).await
    }

    /// Outcome of the schema pass run by `open`
    pub fn schema_report(&self) -> &SchemaReport {
        &self.schema
    }

    /// Persist a turn batch, then queue maintenance if the worker is running
    ///
    /// `context_ids` are the ids retrieved before the reply was generated;
    /// they are linked from the last assistant message of the batch.
    pub async fn write_turn(
        &self,
        user_id: &str,
        thread_id: &str,
        turns: &[Turn],
        context_ids: &[String],
    ) -> MemoryResult<WriteOutcome> {
        let outcome = self
            .writer
            .write_turns(user_id, thread_id, turns, context_ids)
            .await?;

        if let Some(worker) = self.worker.lock().await.as_ref() {
            worker.trigger();
        }
        Ok(outcome)
    }

    /// Embed the query and retrieve matching context; never fails
    pub async fn retrieve(&self, query: &str) -> RetrievedContext {
        self.retriever.retrieve_text(query).await
    }

    /// Retrieve for an already embedded query; never fails
    pub async fn retrieve_vector(&self, query_vector: &[f32]) -> RetrievedContext {
        self.retriever.retrieve(query_vector).await
    }

    /// Link a reply to the context it was grounded on
    pub async fn link_sources(&self, message_id: &str, source_ids: &[String]) -> MemoryResult<usize> {
        self.link_back.link_sources(message_id, source_ids).await
    }

    /// Run maintenance inline
    pub async fn run_maintenance(&self) -> MemoryResult<MaintenanceReport> {
        self.scheduler.run_maintenance().await
    }

    /// Start the background maintenance worker; `false` if it already runs
    pub async fn start_maintenance(&self) -> bool {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return false;
        }

        let interval = self.config.maintenance_interval_secs.map(Duration::from_secs);
        *worker = Some(
            MaintenanceWorker::new(self.scheduler.clone())
                .with_interval(interval)
                .spawn(),
        );
        true
    }

    /// Queue a background run; `false` if the worker is stopped or already queued
    pub async fn trigger_maintenance(&self) -> bool {
        match self.worker.lock().await.as_ref() {
            Some(worker) => worker.trigger(),
            None => false,
        }
    }

    /// Queue a background run and wait for it
    ///
    /// The worker lock is released before waiting, so writes proceed while
    /// the run is in progress.
    pub async fn run_maintenance_in_background(&self) -> MemoryResult<MaintenanceReport> {
        let remote = self.worker.lock().await.as_ref().map(MaintenanceHandle::remote);
        match remote {
            Some(remote) => remote.run_now().await,
            None => Err(MemoryError::configuration("maintenance worker is not started")),
        }
    }

    /// Stop the worker and release the store
    pub async fn close(&self) -> MemoryResult<()> {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "closing store failed");
            return Err(e);
        }
        info!("graph memory closed");
        Ok(())
    }

    /// Storage backend
    pub fn store(&self) -> Arc<dyn GraphStore> {
        self.store.clone()
    }

    /// Embedding backend
    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        self.embedder.clone()
    }

    /// Configuration
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }
}

/// Fresh thread id for callers without a session id
pub fn generate_thread_id() -> String {
    Uuid::new_v4().to_string()
}
