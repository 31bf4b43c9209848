//! Vector retrieval over past messages and source chunks
//!
//! Both vector indexes are queried for the top-K candidates, and only hits
//! scoring above `1 - epsilon` are kept. The gate makes retrieval a
//! near-duplicate detector. A matched message also pulls in the chunks its
//! reply was grounded on, following `NEXT`, then `SOURCED`, then `FIRST`.
//!
//! Retrieval is best-effort: store or provider failures produce an empty
//! context and a log line, never an error for the calling agent.

use crate::config::RetryPolicy;
use crate::embedding::EmbeddingProvider;
use crate::error::{MemoryError, MemoryResult};
use crate::model::{NodeLabel, NodeRef, Relation};
use crate::schema::{CHUNK_VECTOR_INDEX, MESSAGE_VECTOR_INDEX};
use crate::store::{GraphStore, GraphTransaction, NodeRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const CONTENT_PROPERTY: &str = "content";
const MAX_FIRST_HOPS: usize = 8;

/// One retrieved piece of context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    /// Message or Chunk id
    pub id: String,
    /// Stored text
    pub content: String,
}

/// Deduplicated retrieval result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    /// Items in retrieval order
    pub items: Vec<ContextItem>,
}

impl RetrievedContext {
    /// Whether nothing passed the gate
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Ids to hand back to [`LinkBackWriter::link_sources`]
    pub fn context_ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }

    /// Item contents separated by `---` lines
    pub fn context_text(&self) -> String {
        self.items
            .iter()
            .map(|item| item.content.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n")
    }

    /// System prompt fragment, or `None` when there is nothing to inject
    pub fn to_system_prompt(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        Some(format!(
            "INTERNAL KNOWLEDGE FOUND:\n{}\n\nUse this context to answer the user's question when it is relevant.",
            self.context_text()
        ))
    }

    fn push(&mut self, seen: &mut HashSet<String>, record: &NodeRecord) {
        let Some(content) = record.text(CONTENT_PROPERTY) else {
            return;
        };
        if seen.insert(record.key().to_string()) {
            self.items.push(ContextItem {
                id: record.key().to_string(),
                content: content.to_string(),
            });
        }
    }
}

/// Threshold-gated lookup over the message and chunk vector indexes
pub struct Retriever {
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    top_k: usize,
    threshold: f32,
}

impl Retriever {
    /// Create a retriever keeping hits with `score > threshold`
    pub fn new(
        store: Arc<dyn GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        top_k: usize,
        threshold: f32,
    ) -> Self {
        Self {
            store,
            embedder,
            top_k,
            threshold,
        }
    }

    /// Similarity gate in use
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Embed `query` and retrieve, swallowing failures
    #[instrument(skip(self, query), fields(query_len = query.len()))]
    pub async fn retrieve_text(&self, query: &str) -> RetrievedContext {
        if query.trim().is_empty() {
            return RetrievedContext::default();
        }
        match self.embedder.embed_one(query).await {
            Ok(vector) => self.retrieve(&vector).await,
            Err(e) => {
                warn!(error = %e, "query embedding failed, continuing without memory");
                RetrievedContext::default()
            }
        }
    }

    /// Retrieve for a query vector, swallowing failures
    pub async fn retrieve(&self, query_vector: &[f32]) -> RetrievedContext {
        match self.try_retrieve(query_vector).await {
            Ok(context) => {
                if !context.is_empty() {
                    info!(items = context.items.len(), "retrieved internal knowledge");
                }
                context
            }
            Err(e) => {
                warn!(error = %e, "vector retrieval failed, continuing without memory");
                RetrievedContext::default()
            }
        }
    }

    /// Retrieve for a query vector, reporting failures
    #[instrument(skip(self, query_vector), fields(dims = query_vector.len()))]
    pub async fn try_retrieve(&self, query_vector: &[f32]) -> MemoryResult<RetrievedContext> {
        if query_vector.len() != self.embedder.dimensions() {
            return Err(MemoryError::validation(
                "query_vector",
                format!("must have {} dimensions", self.embedder.dimensions()),
                query_vector.len().to_string(),
            ));
        }

        let mut context = RetrievedContext::default();
        let mut seen = HashSet::new();

        let messages = self
            .store
            .vector_search(MESSAGE_VECTOR_INDEX, query_vector, self.top_k)
            .await?;
        for hit in messages.iter().filter(|hit| hit.score > self.threshold) {
            debug!(id = hit.node.key(), score = hit.score, "message hit");
            context.push(&mut seen, &hit.node);
            for grounded in self.grounding_of(&hit.node.node).await? {
                context.push(&mut seen, &grounded);
            }
        }

        let chunks = self
            .store
            .vector_search(CHUNK_VECTOR_INDEX, query_vector, self.top_k)
            .await?;
        for hit in chunks.iter().filter(|hit| hit.score > self.threshold) {
            debug!(id = hit.node.key(), score = hit.score, "chunk hit");
            context.push(&mut seen, &hit.node);
        }

        Ok(context)
    }

    /// Content nodes reached from a message or its successor through `SOURCED`
    async fn grounding_of(&self, message: &NodeRef) -> MemoryResult<Vec<NodeRecord>> {
        let mut candidates = vec![message.clone()];
        candidates.extend(
            self.store
                .outgoing(message, Relation::Next)
                .await?
                .into_iter()
                .map(|record| record.node),
        );

        let mut found = Vec::new();
        for candidate in &candidates {
            for sourced in self.store.outgoing(candidate, Relation::Sourced).await? {
                if matches!(sourced.label(), NodeLabel::Source | NodeLabel::Chunk) {
                    found.extend(self.first_with_content(sourced).await?);
                }
            }
        }
        Ok(found)
    }

    /// The node itself if it has content, else the nearest along `FIRST`
    async fn first_with_content(&self, start: NodeRecord) -> MemoryResult<Vec<NodeRecord>> {
        let mut frontier = vec![start];
        for _ in 0..=MAX_FIRST_HOPS {
            let (ready, pending): (Vec<_>, Vec<_>) = frontier
                .into_iter()
                .partition(|record| record.text(CONTENT_PROPERTY).is_some());
            if !ready.is_empty() || pending.is_empty() {
                return Ok(ready);
            }

            frontier = Vec::new();
            for record in pending {
                frontier.extend(self.store.outgoing(&record.node, Relation::First).await?);
            }
        }
        Ok(Vec::new())
    }
}

/// Records which retrieved items an answer was grounded on
pub struct LinkBackWriter {
    store: Arc<dyn GraphStore>,
    retry: RetryPolicy,
}

impl LinkBackWriter {
    /// Create a link-back writer
    pub fn new(store: Arc<dyn GraphStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Add `SOURCED` edges from a message to retrieved Chunks or Messages
    ///
    /// Ids that match neither label are skipped. Returns the number of ids linked.
    #[instrument(skip(self, source_ids), fields(sources = source_ids.len()))]
    pub async fn link_sources(&self, message_id: &str, source_ids: &[String]) -> MemoryResult<usize> {
        if source_ids.is_empty() {
            return Ok(0);
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_link(message_id, source_ids).await {
                Ok(linked) => {
                    debug!(message_id, linked, "linked retrieved sources");
                    return Ok(linked);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(message_id, attempt, error = %e, ?delay, "transient store error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_link(&self, message_id: &str, source_ids: &[String]) -> MemoryResult<usize> {
        let mut tx = self.store.begin().await?;
        match link_context(tx.as_mut(), &NodeRef::message(message_id), source_ids).await {
            Ok(linked) => {
                tx.commit().await?;
                Ok(linked)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// Link `message` to each id found as a Chunk or, failing that, a Message
pub(crate) async fn link_context(
    tx: &mut dyn GraphTransaction,
    message: &NodeRef,
    ids: &[String],
) -> MemoryResult<usize> {
    if tx.find_node(message).await?.is_none() {
        debug!(%message, "message not found, nothing to link");
        return Ok(0);
    }

    let mut linked = 0;
    let mut seen = HashSet::new();
    for id in ids.iter().filter(|id| seen.insert(id.as_str())) {
        let mut target = None;
        for candidate in [NodeRef::chunk(id), NodeRef::message(id)] {
            if candidate != *message && tx.find_node(&candidate).await?.is_some() {
                target = Some(candidate);
                break;
            }
        }

        match target {
            Some(target) => {
                tx.merge_edge(message, Relation::Sourced, &target).await?;
                linked += 1;
            }
            None => debug!(id = id.as_str(), "context id matches no chunk or message"),
        }
    }
    Ok(linked)
}
