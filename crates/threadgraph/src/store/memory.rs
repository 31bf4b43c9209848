//! In-process graph store backed by petgraph
//!
//! Transactions take the store lock for their whole lifetime and work on a
//! private copy of the graph, swapped in on commit. That gives atomic batches,
//! read-your-writes inside a transaction, and serialized chain-tail appends.
//! Meant for tests, demos and single-process deployments.

use super::{GraphStore, GraphTransaction, NodeRecord, PendingContent, Properties, ScoredNode};
use crate::embedding::cosine_similarity;
use crate::error::{MemoryError, MemoryResult};
use crate::model::{NodeLabel, NodeRef, Relation};
use crate::schema::SchemaStatement;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct GraphState {
    graph: DiGraph<NodeRecord, Relation>,
    keys: HashMap<NodeRef, NodeIndex>,
    schema: BTreeMap<String, SchemaStatement>,
}

impl GraphState {
    fn merge_node(&mut self, node: &NodeRef, on_create: Properties) -> bool {
        if self.keys.contains_key(node) {
            return false;
        }
        let idx = self
            .graph
            .add_node(NodeRecord::new(node.clone(), on_create));
        self.keys.insert(node.clone(), idx);
        true
    }

    fn merge_edge(&mut self, from: &NodeRef, relation: Relation, to: &NodeRef) -> MemoryResult<()> {
        let (a, b) = match (self.keys.get(from), self.keys.get(to)) {
            (Some(a), Some(b)) => (*a, *b),
            _ => {
                return Err(MemoryError::store(
                    "merge_edge",
                    format!("missing endpoint for {} -[{}]-> {}", from, relation, to),
                ))
            }
        };

        let exists = self
            .graph
            .edges_connecting(a, b)
            .any(|edge| *edge.weight() == relation);
        if !exists {
            self.graph.add_edge(a, b, relation);
        }
        Ok(())
    }

    fn set_missing(&mut self, node: &NodeRef, properties: Properties) -> usize {
        let Some(idx) = self.keys.get(node).copied() else {
            return 0;
        };
        let record = &mut self.graph[idx];
        let mut written = 0;
        for (name, value) in properties {
            if !record.properties.contains_key(&name) {
                record.properties.insert(name, value);
                written += 1;
            }
        }
        written
    }

    fn find_node(&self, node: &NodeRef) -> Option<NodeRecord> {
        self.keys.get(node).map(|idx| self.graph[*idx].clone())
    }

    fn outgoing(&self, node: &NodeRef, relation: Relation) -> Vec<NodeRecord> {
        let Some(idx) = self.keys.get(node).copied() else {
            return Vec::new();
        };
        let mut targets: Vec<NodeRecord> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|edge| *edge.weight() == relation)
            .map(|edge| self.graph[edge.target()].clone())
            .collect();
        targets.sort_by(|a, b| {
            (a.label().as_str(), a.key()).cmp(&(b.label().as_str(), b.key()))
        });
        targets
    }

    fn nodes_with_label(&self, label: NodeLabel) -> impl Iterator<Item = (NodeIndex, &NodeRecord)> + '_ {
        self.graph
            .node_indices()
            .map(move |idx| (idx, &self.graph[idx]))
            .filter(move |(_, record)| record.label() == label)
    }

    fn run_schema(&mut self, statement: &SchemaStatement) -> MemoryResult<()> {
        match self.schema.get(statement.name()) {
            Some(existing) if existing == statement => Ok(()),
            Some(_) => Err(MemoryError::Schema {
                name: statement.name().to_string(),
                message: "an equivalent schema object with a different definition already exists"
                    .to_string(),
            }),
            None => {
                self.schema
                    .insert(statement.name().to_string(), statement.clone());
                Ok(())
            }
        }
    }

    fn vector_search(&self, index: &str, vector: &[f32], limit: usize) -> MemoryResult<Vec<ScoredNode>> {
        let (label, property, dimensions) = match self.schema.get(index) {
            Some(SchemaStatement::Vector {
                label,
                property,
                dimensions,
                ..
            }) => (*label, property.as_str(), *dimensions),
            _ => {
                return Err(MemoryError::Retrieval(format!(
                    "vector index '{}' does not exist",
                    index
                )))
            }
        };

        if vector.len() != dimensions {
            return Err(MemoryError::validation(
                "query_vector",
                format!("must have {} dimensions", dimensions),
                vector.len().to_string(),
            ));
        }

        let mut hits: Vec<ScoredNode> = self
            .nodes_with_label(label)
            .filter_map(|(_, record)| {
                let stored = record.properties.get(property)?.as_vector()?;
                if stored.len() != dimensions {
                    return None;
                }
                // cosine mapped onto [0, 1], as vector indexes report it
                let score = (1.0 + cosine_similarity(vector, stored)) / 2.0;
                Some(ScoredNode {
                    node: record.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.node.key().cmp(b.node.key()))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Node and edge counts of an [`InMemoryGraphStore`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphStats {
    /// Nodes per label
    pub nodes: HashMap<NodeLabel, usize>,
    /// Edges per relationship type
    pub edges: HashMap<Relation, usize>,
}

impl GraphStats {
    /// Number of nodes with a label
    pub fn nodes(&self, label: NodeLabel) -> usize {
        self.nodes.get(&label).copied().unwrap_or(0)
    }

    /// Number of edges of a type
    pub fn edges(&self, relation: Relation) -> usize {
        self.edges.get(&relation).copied().unwrap_or(0)
    }

    /// Total nodes
    pub fn total_nodes(&self) -> usize {
        self.nodes.values().sum()
    }

    /// Total edges
    pub fn total_edges(&self) -> usize {
        self.edges.values().sum()
    }
}

/// Graph store kept in process memory
#[derive(Clone, Default)]
pub struct InMemoryGraphStore {
    state: Arc<Mutex<GraphState>>,
    failing_commits: Arc<AtomicU32>,
}

impl InMemoryGraphStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with a transient error
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Count nodes and edges
    pub async fn stats(&self) -> GraphStats {
        let state = self.state.lock().await;
        let mut stats = GraphStats::default();
        for record in state.graph.node_weights() {
            *stats.nodes.entry(record.label()).or_default() += 1;
        }
        for relation in state.graph.edge_weights() {
            *stats.edges.entry(*relation).or_default() += 1;
        }
        stats
    }

    /// Snapshot of every node with a label, ordered by key
    pub async fn nodes(&self, label: NodeLabel) -> Vec<NodeRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<NodeRecord> = state
            .nodes_with_label(label)
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by(|a, b| a.key().cmp(b.key()));
        records
    }
}

#[async_trait::async_trait]
impl GraphStore for InMemoryGraphStore {
    fn backend_name(&self) -> &str {
        "in-memory"
    }

    async fn run_schema(&self, statement: &SchemaStatement) -> MemoryResult<()> {
        self.state.lock().await.run_schema(statement)
    }

    async fn begin(&self) -> MemoryResult<Box<dyn GraphTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTransaction {
            guard,
            working,
            failing_commits: self.failing_commits.clone(),
        }))
    }

    async fn find_node(&self, node: &NodeRef) -> MemoryResult<Option<NodeRecord>> {
        Ok(self.state.lock().await.find_node(node))
    }

    async fn outgoing(&self, node: &NodeRef, relation: Relation) -> MemoryResult<Vec<NodeRecord>> {
        Ok(self.state.lock().await.outgoing(node, relation))
    }

    async fn pending_embeddings(&self, label: NodeLabel) -> MemoryResult<Vec<PendingContent>> {
        let state = self.state.lock().await;
        let mut pending: Vec<PendingContent> = state
            .nodes_with_label(label)
            .filter(|(_, record)| record.embedding().is_none())
            .filter_map(|(_, record)| {
                record.content().map(|text| PendingContent {
                    node: record.node.clone(),
                    text: text.to_string(),
                })
            })
            .collect();
        pending.sort_by(|a, b| a.node.key.cmp(&b.node.key));
        Ok(pending)
    }

    async fn unchunked_sources(&self) -> MemoryResult<Vec<PendingContent>> {
        let state = self.state.lock().await;
        let mut pending: Vec<PendingContent> = state
            .nodes_with_label(NodeLabel::Source)
            .filter(|(idx, _)| {
                !state
                    .graph
                    .edges_directed(*idx, Direction::Outgoing)
                    .any(|edge| *edge.weight() == Relation::First)
            })
            .filter_map(|(_, record)| {
                record.content().map(|text| PendingContent {
                    node: record.node.clone(),
                    text: text.to_string(),
                })
            })
            .collect();
        pending.sort_by(|a, b| a.node.key.cmp(&b.node.key));
        Ok(pending)
    }

    async fn vector_search(
        &self,
        index: &str,
        vector: &[f32],
        limit: usize,
    ) -> MemoryResult<Vec<ScoredNode>> {
        self.state.lock().await.vector_search(index, vector, limit)
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<GraphState>,
    working: GraphState,
    failing_commits: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl GraphTransaction for InMemoryTransaction {
    async fn merge_node(&mut self, node: &NodeRef, on_create: Properties) -> MemoryResult<bool> {
        Ok(self.working.merge_node(node, on_create))
    }

    async fn merge_edge(
        &mut self,
        from: &NodeRef,
        relation: Relation,
        to: &NodeRef,
    ) -> MemoryResult<()> {
        self.working.merge_edge(from, relation, to)
    }

    async fn set_missing(&mut self, node: &NodeRef, properties: Properties) -> MemoryResult<usize> {
        Ok(self.working.set_missing(node, properties))
    }

    async fn find_node(&mut self, node: &NodeRef) -> MemoryResult<Option<NodeRecord>> {
        Ok(self.working.find_node(node))
    }

    async fn outgoing(
        &mut self,
        node: &NodeRef,
        relation: Relation,
    ) -> MemoryResult<Vec<NodeRecord>> {
        Ok(self.working.outgoing(node, relation))
    }

    async fn commit(self: Box<Self>) -> MemoryResult<()> {
        let InMemoryTransaction {
            mut guard,
            working,
            failing_commits,
        } = *self;

        let injected = failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MemoryError::transient("commit", "lock acquisition timed out"));
        }

        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> MemoryResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaStatement;
    use crate::store::{properties, PropertyValue};

    fn text(value: &str) -> Option<PropertyValue> {
        Some(PropertyValue::from(value))
    }

    #[tokio::test]
    async fn test_merge_node_is_first_write_wins() {
        let store = InMemoryGraphStore::new();
        let source = NodeRef::source("https://a");

        let mut tx = store.begin().await.unwrap();
        assert!(tx
            .merge_node(&source, properties([("text", text("first"))]))
            .await
            .unwrap());
        assert!(!tx
            .merge_node(&source, properties([("text", text("second"))]))
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let record = store.find_node(&source).await.unwrap().unwrap();
        assert_eq!(record.content(), Some("first"));
    }

    #[tokio::test]
    async fn test_merge_edge_does_not_duplicate() {
        let store = InMemoryGraphStore::new();
        let a = NodeRef::message("a");
        let b = NodeRef::message("b");

        let mut tx = store.begin().await.unwrap();
        tx.merge_node(&a, Properties::new()).await.unwrap();
        tx.merge_node(&b, Properties::new()).await.unwrap();
        tx.merge_edge(&a, Relation::Next, &b).await.unwrap();
        tx.merge_edge(&a, Relation::Next, &b).await.unwrap();
        tx.merge_edge(&a, Relation::Sourced, &b).await.unwrap();
        assert!(tx
            .merge_edge(&a, Relation::Next, &NodeRef::message("missing"))
            .await
            .is_err());
        tx.commit().await.unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.edges(Relation::Next), 1);
        assert_eq!(stats.edges(Relation::Sourced), 1);
    }

    #[tokio::test]
    async fn test_rollback_and_failed_commit_leave_graph_unchanged() {
        let store = InMemoryGraphStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.merge_node(&NodeRef::thread("T1"), Properties::new())
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.stats().await.total_nodes(), 0);

        store.fail_next_commits(1);
        let mut tx = store.begin().await.unwrap();
        tx.merge_node(&NodeRef::thread("T1"), Properties::new())
            .await
            .unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.stats().await.total_nodes(), 0);
    }

    #[tokio::test]
    async fn test_set_missing_never_overwrites() {
        let store = InMemoryGraphStore::new();
        let chunk = NodeRef::chunk("c");

        let mut tx = store.begin().await.unwrap();
        tx.merge_node(&chunk, properties([("content", text("x"))]))
            .await
            .unwrap();
        let written = tx
            .set_missing(
                &chunk,
                properties([
                    ("content", text("y")),
                    ("embedding", Some(PropertyValue::Vector(vec![1.0, 0.0]))),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(
            tx.set_missing(&NodeRef::chunk("nope"), Properties::new())
                .await
                .unwrap(),
            0
        );
        tx.commit().await.unwrap();

        let record = store.find_node(&chunk).await.unwrap().unwrap();
        assert_eq!(record.content(), Some("x"));
        assert_eq!(record.embedding(), Some(&[1.0, 0.0][..]));
    }

    #[tokio::test]
    async fn test_vector_search_scores_and_missing_index() {
        let store = InMemoryGraphStore::new();
        assert!(store.vector_search("idx", &[1.0, 0.0], 3).await.is_err());

        store
            .run_schema(&SchemaStatement::vector("idx", NodeLabel::Chunk, 2))
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        for (id, vector) in [("same", vec![1.0, 0.0]), ("orthogonal", vec![0.0, 1.0])] {
            tx.merge_node(
                &NodeRef::chunk(id),
                properties([("embedding", Some(PropertyValue::Vector(vector)))]),
            )
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let hits = store.vector_search("idx", &[1.0, 0.0], 3).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].node.key(), "same");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!((hits[1].score - 0.5).abs() < 1e-6);

        let limited = store.vector_search("idx", &[1.0, 0.0], 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
