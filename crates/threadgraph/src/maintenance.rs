//! Background maintenance: embeddings and source chunking
//!
//! Ingestion stores text only. A maintenance run then fills in what is
//! missing, in two phases:
//!
//! - **Phase A** embeds Messages and Chunks that have content but no vector.
//! - **Phase B** splits each unchunked Source into a `FIRST`/`NEXT` chain of
//!   Chunks, commits the chain, then embeds the new chunks.
//!
//! Every write only touches absent properties, so runs converge: once the
//! graph is caught up, a run reports nothing to do. A batch or source that
//! fails is logged, counted in [`MaintenanceReport::failed`] and left for the
//! next run; it never stops the rest of the run.

use crate::chunking::{chunk_id, chunk_source, ChunkSlice, TextSplitter};
use crate::embedding::{check_batch, EmbeddingProvider};
use crate::error::{MemoryError, MemoryResult};
use crate::model::{NodeLabel, NodeRef, Relation};
use crate::schema::EMBEDDING_PROPERTY;
use crate::store::{properties, GraphStore, GraphTransaction, PendingContent, PropertyValue};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What a maintenance run wrote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Messages that received an embedding
    pub messages_embedded: usize,
    /// Pre-existing chunks that received an embedding
    pub chunks_embedded: usize,
    /// Sources split into chunk chains
    pub sources_chunked: usize,
    /// Chunk nodes created
    pub chunks_created: usize,
    /// Nodes or sources left pending because embedding or writing them failed
    pub failed: usize,
}

impl MaintenanceReport {
    /// Whether the run found nothing to do
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Embedded and failed counts for one set of nodes
#[derive(Debug, Default, Clone, Copy)]
struct EmbedTally {
    embedded: usize,
    failed: usize,
}

/// Runs maintenance passes against a store
pub struct MaintenanceScheduler {
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    splitter: Arc<dyn TextSplitter>,
    batch_size: usize,
}

impl MaintenanceScheduler {
    /// Create a scheduler embedding `batch_size` texts per request
    pub fn new(
        store: Arc<dyn GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        splitter: Arc<dyn TextSplitter>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            splitter,
            batch_size: batch_size.max(1),
        }
    }

    /// Run both phases once
    ///
    /// Only failing to list pending work is an error. Failed batches and
    /// sources are counted in the report and retried by the next run.
    #[instrument(skip(self))]
    pub async fn run_maintenance(&self) -> MemoryResult<MaintenanceReport> {
        let started = Instant::now();
        let mut report = MaintenanceReport::default();

        let messages = self.embed_nodes(&self.store.pending_embeddings(NodeLabel::Message).await?).await;
        report.messages_embedded = messages.embedded;
        report.failed += messages.failed;

        let chunks = self.embed_nodes(&self.store.pending_embeddings(NodeLabel::Chunk).await?).await;
        report.chunks_embedded = chunks.embedded;
        report.failed += chunks.failed;

        for source in self.store.unchunked_sources().await? {
            let new_chunks = match self.write_chunk_chain(&source).await {
                Ok(Some((created, new_chunks))) => {
                    report.sources_chunked += 1;
                    report.chunks_created += created;
                    new_chunks
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(url = %source.node.key, error = %e, "chunking source failed, left pending");
                    report.failed += 1;
                    continue;
                }
            };
            // chunks that fail here are picked up by Phase A next run
            report.failed += self.embed_nodes(&new_chunks).await.failed;
        }

        if report.is_idle() {
            debug!("maintenance found nothing to do");
        } else {
            info!(
                messages = report.messages_embedded,
                chunks = report.chunks_embedded,
                sources = report.sources_chunked,
                new_chunks = report.chunks_created,
                failed = report.failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "maintenance run complete"
            );
        }
        Ok(report)
    }

    /// Embed `items` in batches, falling back to one item at a time when a
    /// batch fails so a single rejected text does not hold back the rest
    async fn embed_nodes(&self, items: &[PendingContent]) -> EmbedTally {
        let mut tally = EmbedTally::default();
        if items.is_empty() {
            return tally;
        }
        debug!(count = items.len(), "embedding pending nodes");

        for batch in items.chunks(self.batch_size) {
            match self.embed_batch(batch).await {
                Ok(written) => tally.embedded += written,
                Err(e) if batch.len() > 1 => {
                    warn!(size = batch.len(), error = %e, "embedding batch failed, retrying one at a time");
                    for item in batch {
                        match self.embed_batch(std::slice::from_ref(item)).await {
                            Ok(written) => tally.embedded += written,
                            Err(e) => {
                                warn!(node = %item.node, error = %e, "embedding failed, left pending");
                                tally.failed += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(node = %batch[0].node, error = %e, "embedding failed, left pending");
                    tally.failed += 1;
                }
            }
        }
        tally
    }

    /// Embed one batch and write the vectors in one transaction
    async fn embed_batch(&self, batch: &[PendingContent]) -> MemoryResult<usize> {
        let vectors = self.embed(batch.iter().map(|p| p.text.clone()).collect()).await?;

        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut written = 0;
        for (item, vector) in batch.iter().zip(vectors) {
            match tx.set_missing(&item.node, embedding_properties(vector, now)).await {
                Ok(count) => written += (count > 0) as usize,
                Err(e) => {
                    rollback(tx).await;
                    return Err(e);
                }
            }
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Phase B for one source: commit the text-only chunk chain
    ///
    /// Returns the number of chunks created and the chunks to embed, or
    /// `None` when the source has no text or another run got there first.
    async fn write_chunk_chain(
        &self,
        source: &PendingContent,
    ) -> MemoryResult<Option<(usize, Vec<PendingContent>)>> {
        let slices = chunk_source(self.splitter.as_ref(), &source.text);
        if slices.is_empty() {
            debug!(url = %source.node.key, "source has no text to chunk");
            return Ok(None);
        }

        let mut tx = self.store.begin().await?;
        let chunks = match write_chain(tx.as_mut(), &source.node, &slices).await {
            Ok(chunks) => chunks,
            Err(e) => {
                rollback(tx).await;
                return Err(e);
            }
        };
        let Some((created, chunks)) = chunks else {
            rollback(tx).await;
            debug!(url = %source.node.key, "source already chunked");
            return Ok(None);
        };
        tx.commit().await?;

        debug!(url = %source.node.key, chunks = chunks.len(), "source chunked");
        Ok(Some((created, chunks)))
    }

    async fn embed(&self, texts: Vec<String>) -> MemoryResult<Vec<Vec<f32>>> {
        let vectors = self.embedder.embed_many(&texts).await?;
        check_batch(&texts, &vectors, self.embedder.dimensions())?;
        Ok(vectors)
    }
}

/// Merge the chunk chain under `source`; `None` if it already has a `FIRST`
async fn write_chain(
    tx: &mut dyn GraphTransaction,
    source: &NodeRef,
    slices: &[ChunkSlice],
) -> MemoryResult<Option<(usize, Vec<PendingContent>)>> {
    if !tx.outgoing(source, Relation::First).await?.is_empty() {
        return Ok(None);
    }

    let now = Utc::now();
    let mut created = 0;
    let mut chunks = Vec::with_capacity(slices.len());
    let mut previous: Option<NodeRef> = None;
    for slice in slices {
        let chunk = NodeRef::chunk(chunk_id(&source.key, slice.index));
        let is_new = tx
            .merge_node(
                &chunk,
                properties([
                    ("content", Some(PropertyValue::from(slice.text.as_str()))),
                    ("index", Some(slice.index.into())),
                    ("created_at", Some(now.into())),
                ]),
            )
            .await?;
        created += is_new as usize;

        match &previous {
            Some(prev) => tx.merge_edge(prev, Relation::Next, &chunk).await?,
            None => tx.merge_edge(source, Relation::First, &chunk).await?,
        }
        chunks.push(PendingContent {
            node: chunk.clone(),
            text: slice.text.clone(),
        });
        previous = Some(chunk);
    }
    Ok(Some((created, chunks)))
}

async fn rollback(tx: Box<dyn GraphTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "rollback failed");
    }
}

fn embedding_properties(vector: Vec<f32>, at: chrono::DateTime<Utc>) -> crate::store::Properties {
    properties([
        (EMBEDDING_PROPERTY, Some(PropertyValue::Vector(vector))),
        ("embedded_at", Some(at.into())),
    ])
}

/// Observable state of a [`MaintenanceWorker`]
#[derive(Debug, Clone, PartialEq)]
pub enum MaintenanceStatus {
    /// No run yet
    Idle,
    /// A run is in progress
    Running,
    /// Last run finished
    Completed(MaintenanceReport),
    /// Last run failed
    Failed(String),
}

type RunReply = oneshot::Sender<MemoryResult<MaintenanceReport>>;

/// Single background task that owns maintenance runs
///
/// Triggers are coalesced: while a run is queued, further triggers are
/// dropped, and runs never overlap.
pub struct MaintenanceWorker {
    scheduler: Arc<MaintenanceScheduler>,
    interval: Option<Duration>,
}

impl MaintenanceWorker {
    /// Create a worker that only runs when triggered
    pub fn new(scheduler: Arc<MaintenanceScheduler>) -> Self {
        Self {
            scheduler,
            interval: None,
        }
    }

    /// Also run every `interval`
    pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval.filter(|d| !d.is_zero());
        self
    }

    /// Start the worker on the current runtime
    pub fn spawn(self) -> MaintenanceHandle {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(MaintenanceStatus::Idle);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(self.run(trigger_rx, status_tx, cancel.clone()));

        MaintenanceHandle {
            trigger: MaintenanceTrigger { sender: trigger_tx },
            status: status_rx,
            cancel,
            task,
        }
    }

    async fn run(
        self,
        mut triggers: mpsc::Receiver<Option<RunReply>>,
        status: watch::Sender<MaintenanceStatus>,
        cancel: CancellationToken,
    ) {
        let periodic = self.interval.is_some();
        let period = self.interval.unwrap_or(Duration::from_secs(3600));
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(periodic, "maintenance worker started");
        loop {
            let reply = tokio::select! {
                _ = cancel.cancelled() => break,
                request = triggers.recv() => match request {
                    Some(reply) => reply,
                    None => break,
                },
                _ = ticker.tick(), if periodic => None,
            };

            status.send_replace(MaintenanceStatus::Running);
            let result = self.scheduler.run_maintenance().await;
            match &result {
                Ok(report) => {
                    status.send_replace(MaintenanceStatus::Completed(report.clone()));
                }
                Err(e) => {
                    error!(error = %e, "maintenance run failed");
                    status.send_replace(MaintenanceStatus::Failed(e.to_string()));
                }
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
        info!("maintenance worker stopped");
    }
}

/// Cloneable sender of run requests to a [`MaintenanceWorker`]
///
/// Holding one does not keep the worker alive; requests fail once it stops.
#[derive(Clone)]
pub struct MaintenanceTrigger {
    sender: mpsc::Sender<Option<RunReply>>,
}

impl MaintenanceTrigger {
    /// Ask for a run without waiting; returns `false` if one is already queued
    pub fn trigger(&self) -> bool {
        match self.sender.try_send(None) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("maintenance already queued");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("maintenance worker is not running");
                false
            }
        }
    }

    /// Queue a run and wait for its report
    pub async fn run_now(&self) -> MemoryResult<MaintenanceReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Some(reply_tx))
            .await
            .map_err(|_| MemoryError::store("maintenance", "worker is not running"))?;
        reply_rx
            .await
            .map_err(|_| MemoryError::store("maintenance", "worker stopped before replying"))?
    }
}

/// Control side of a spawned [`MaintenanceWorker`]
pub struct MaintenanceHandle {
    trigger: MaintenanceTrigger,
    status: watch::Receiver<MaintenanceStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Ask for a run without waiting; returns `false` if one is already queued
    pub fn trigger(&self) -> bool {
        self.trigger.trigger()
    }

    /// Queue a run and wait for its report
    pub async fn run_now(&self) -> MemoryResult<MaintenanceReport> {
        self.trigger.run_now().await
    }

    /// Request sender usable without borrowing the handle
    pub fn remote(&self) -> MaintenanceTrigger {
        self.trigger.clone()
    }

    /// Latest status
    pub fn status(&self) -> MaintenanceStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change
    pub fn subscribe(&self) -> watch::Receiver<MaintenanceStatus> {
        self.status.clone()
    }

    /// Stop the worker after any in-flight run and wait for it
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "maintenance worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::RecursiveTextSplitter;
    use crate::embedding::HashEmbeddingProvider;
    use crate::store::InMemoryGraphStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn seeded_store() -> Arc<InMemoryGraphStore> {
        let store = Arc::new(InMemoryGraphStore::new());
        let mut tx = store.begin().await.unwrap();
        for (id, content) in [("m1", "hello"), ("m2", "world")] {
            tx.merge_node(
                &NodeRef::message(id),
                properties([("content", Some(PropertyValue::from(content)))]),
            )
            .await
            .unwrap();
        }
        let long_text = (0..40)
            .map(|i| format!("Sentence {} explains how procedures extend the database.", i))
            .collect::<Vec<_>>()
            .join(" ");
        tx.merge_node(
            &NodeRef::source("https://apoc"),
            properties([("text", Some(PropertyValue::from(long_text)))]),
        )
        .await
        .unwrap();
        tx.merge_node(
            &NodeRef::source("https://short"),
            properties([("text", Some(PropertyValue::from("short page")))]),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        store
    }

    fn scheduler(store: &Arc<InMemoryGraphStore>, batch_size: usize) -> MaintenanceScheduler {
        scheduler_with(store, Arc::new(HashEmbeddingProvider::new(8)), batch_size)
    }

    fn scheduler_with(
        store: &Arc<InMemoryGraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
    ) -> MaintenanceScheduler {
        MaintenanceScheduler::new(
            store.clone(),
            embedder,
            Arc::new(RecursiveTextSplitter::new(500, 100).unwrap()),
            batch_size,
        )
    }

    /// Rejects texts containing `marker`, and everything during an outage
    struct FlakyEmbedder {
        inner: HashEmbeddingProvider,
        marker: &'static str,
        outage: AtomicBool,
    }

    impl FlakyEmbedder {
        fn new(marker: &'static str, outage: bool) -> Self {
            Self {
                inner: HashEmbeddingProvider::new(8),
                marker,
                outage: AtomicBool::new(outage),
            }
        }
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        async fn embed_one(&self, text: &str) -> MemoryResult<Vec<f32>> {
            if self.outage.load(Ordering::SeqCst) || text.contains(self.marker) {
                return Err(MemoryError::embedding("input rejected"));
            }
            self.inner.embed_one(text).await
        }

        fn model_name(&self) -> &str {
            "flaky"
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    #[tokio::test]
    async fn test_run_converges() {
        let store = seeded_store().await;
        let scheduler = scheduler(&store, 1);

        let first = scheduler.run_maintenance().await.unwrap();
        assert_eq!(first.messages_embedded, 2);
        assert_eq!(first.chunks_embedded, 0);
        assert_eq!(first.sources_chunked, 2);
        assert!(first.chunks_created > 2);

        let stats = store.stats().await;
        assert_eq!(stats.nodes(NodeLabel::Chunk), first.chunks_created);
        assert_eq!(stats.edges(Relation::First), 2);
        assert_eq!(stats.edges(Relation::Next), first.chunks_created - 2);
        for chunk in store.nodes(NodeLabel::Chunk).await {
            assert_eq!(chunk.embedding().map(<[f32]>::len), Some(8));
        }

        let second = scheduler.run_maintenance().await.unwrap();
        assert!(second.is_idle());
        assert_eq!(store.stats().await, stats);
    }

    #[tokio::test]
    async fn test_chunk_chain_is_ordered_from_first() {
        let store = seeded_store().await;
        scheduler(&store, 50).run_maintenance().await.unwrap();

        let mut index = 0;
        let mut next = store
            .outgoing(&NodeRef::source("https://apoc"), Relation::First)
            .await
            .unwrap();
        while let Some(chunk) = next.pop() {
            assert_eq!(chunk.key(), chunk_id("https://apoc", index));
            index += 1;
            next = store.outgoing(&chunk.node, Relation::Next).await.unwrap();
        }
        assert!(index > 1);
    }

    #[tokio::test]
    async fn test_straggler_chunks_are_embedded() {
        let store = Arc::new(InMemoryGraphStore::new());
        let mut tx = store.begin().await.unwrap();
        tx.merge_node(
            &NodeRef::chunk("https://x_0"),
            properties([("content", Some(PropertyValue::from("orphan")))]),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let report = scheduler(&store, 50).run_maintenance().await.unwrap();
        assert_eq!(report.chunks_embedded, 1);
        assert_eq!(report.messages_embedded, 0);
    }

    #[tokio::test]
    async fn test_rejected_text_does_not_block_other_work() {
        let store = seeded_store().await;
        let mut tx = store.begin().await.unwrap();
        tx.merge_node(
            &NodeRef::message("m3"),
            properties([("content", Some(PropertyValue::from("POISON question")))]),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        let scheduler = scheduler_with(&store, Arc::new(FlakyEmbedder::new("POISON", false)), 50);

        let first = scheduler.run_maintenance().await.unwrap();
        assert_eq!(first.messages_embedded, 2);
        assert_eq!(first.sources_chunked, 2);
        assert_eq!(first.failed, 1);
        for chunk in store.nodes(NodeLabel::Chunk).await {
            assert!(chunk.embedding().is_some());
        }
        let rejected = store.find_node(&NodeRef::message("m3")).await.unwrap().unwrap();
        assert!(rejected.embedding().is_none());

        let stats = store.stats().await;
        let second = scheduler.run_maintenance().await.unwrap();
        assert_eq!(second.messages_embedded, 0);
        assert_eq!(second.sources_chunked, 0);
        assert_eq!(second.failed, 1);
        assert!(!second.is_idle());
        assert_eq!(store.stats().await, stats);
    }

    #[tokio::test]
    async fn test_chunk_chain_survives_embedding_outage() {
        let store = seeded_store().await;
        let embedder = Arc::new(FlakyEmbedder::new("never matches", true));
        let scheduler = scheduler_with(&store, embedder.clone(), 50);

        let during = scheduler.run_maintenance().await.unwrap();
        assert_eq!(during.messages_embedded, 0);
        assert_eq!(during.sources_chunked, 2);
        assert_eq!(during.failed, 2 + during.chunks_created);

        let stats = store.stats().await;
        assert_eq!(stats.nodes(NodeLabel::Chunk), during.chunks_created);
        assert_eq!(stats.edges(Relation::First), 2);
        assert_eq!(stats.edges(Relation::Next), during.chunks_created - 2);
        for chunk in store.nodes(NodeLabel::Chunk).await {
            assert!(chunk.content().is_some());
            assert!(chunk.embedding().is_none());
        }

        embedder.outage.store(false, Ordering::SeqCst);
        let after = scheduler.run_maintenance().await.unwrap();
        assert_eq!(after.messages_embedded, 2);
        assert_eq!(after.chunks_embedded, during.chunks_created);
        assert_eq!(after.sources_chunked, 0);
        assert_eq!(after.failed, 0);
        for chunk in store.nodes(NodeLabel::Chunk).await {
            assert_eq!(chunk.embedding().map(<[f32]>::len), Some(8));
        }
        assert!(scheduler.run_maintenance().await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_worker_runs_on_demand_and_shuts_down() {
        let store = seeded_store().await;
        let handle = MaintenanceWorker::new(Arc::new(scheduler(&store, 50))).spawn();
        assert_eq!(handle.status(), MaintenanceStatus::Idle);

        let report = handle.run_now().await.unwrap();
        assert_eq!(report.messages_embedded, 2);
        assert_eq!(handle.status(), MaintenanceStatus::Completed(report));

        let report = handle.run_now().await.unwrap();
        assert!(report.is_idle());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_trigger_updates_status() {
        let store = seeded_store().await;
        let handle = MaintenanceWorker::new(Arc::new(scheduler(&store, 50))).spawn();
        let mut status = handle.subscribe();

        assert!(handle.trigger());
        loop {
            status.changed().await.unwrap();
            if let MaintenanceStatus::Completed(report) = status.borrow().clone() {
                assert_eq!(report.sources_chunked, 2);
                break;
            }
        }
        handle.shutdown().await;
    }
}
