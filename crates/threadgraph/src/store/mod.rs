//! Graph store abstraction
//!
//! The ingestion and retrieval protocols only rely on a handful of store
//! primitives: keyed MERGE-style upsert, idempotent edge merge, write-once
//! property updates, ordered traversal and vector similarity search. Writes
//! happen inside a [`GraphTransaction`] that either commits as a whole or
//! leaves the graph untouched.

mod memory;
#[cfg(feature = "neo4j")]
mod neo4j;

pub use memory::{GraphStats, InMemoryGraphStore};
#[cfg(feature = "neo4j")]
pub use neo4j::Neo4jGraphStore;

use crate::error::MemoryResult;
use crate::model::{NodeLabel, NodeRef, Relation};
use crate::schema::{SchemaStatement, EMBEDDING_PROPERTY};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A property value as stored on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// String
    Text(String),
    /// Integer
    Integer(i64),
    /// Float
    Float(f64),
    /// Embedding vector
    Vector(Vec<f32>),
    /// Point in time
    Timestamp(DateTime<Utc>),
}

impl PropertyValue {
    /// String value, if this is one
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Integer value, if this is one
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PropertyValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Vector value, if this is one
    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            PropertyValue::Vector(vector) => Some(vector),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<usize> for PropertyValue {
    fn from(value: usize) -> Self {
        PropertyValue::Integer(value as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<Vec<f32>> for PropertyValue {
    fn from(value: Vec<f32>) -> Self {
        PropertyValue::Vector(value)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        PropertyValue::Timestamp(value)
    }
}

/// Node properties, ordered by name
pub type Properties = BTreeMap<String, PropertyValue>;

/// Build a [`Properties`] map from `(name, value)` pairs, skipping `None` values
pub fn properties<I, K>(pairs: I) -> Properties
where
    I: IntoIterator<Item = (K, Option<PropertyValue>)>,
    K: Into<String>,
{
    pairs
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k.into(), v)))
        .collect()
}

/// A node read back from the store
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    /// Identity
    pub node: NodeRef,
    /// Stored properties (key property excluded)
    pub properties: Properties,
}

impl NodeRecord {
    /// Create a record
    pub fn new(node: NodeRef, properties: Properties) -> Self {
        Self { node, properties }
    }

    /// Node key
    pub fn key(&self) -> &str {
        &self.node.key
    }

    /// Node label
    pub fn label(&self) -> NodeLabel {
        self.node.label
    }

    /// String property
    pub fn text(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(PropertyValue::as_text)
    }

    /// The label's embeddable text (`content`, or `text` for sources)
    pub fn content(&self) -> Option<&str> {
        self.text(self.node.label.text_property())
    }

    /// Stored embedding
    pub fn embedding(&self) -> Option<&[f32]> {
        self.properties
            .get(EMBEDDING_PROPERTY)
            .and_then(PropertyValue::as_vector)
    }
}

/// A vector search hit
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNode {
    /// Matched node
    pub node: NodeRecord,
    /// Similarity in `[0, 1]`, 1 meaning identical direction
    pub score: f32,
}

/// A node whose text still has to be embedded or chunked
#[derive(Debug, Clone, PartialEq)]
pub struct PendingContent {
    /// Node identity
    pub node: NodeRef,
    /// Text to process
    pub text: String,
}

/// Write-side view of the store, scoped to one atomic unit
///
/// Reads made through the transaction observe its own uncommitted writes.
#[async_trait::async_trait]
pub trait GraphTransaction: Send {
    /// Upsert a node by key; `on_create` is applied only when the node is new
    ///
    /// Returns whether the node was created.
    async fn merge_node(&mut self, node: &NodeRef, on_create: Properties) -> MemoryResult<bool>;

    /// Create the edge unless an edge of that type already joins the two nodes
    ///
    /// Both endpoints must exist.
    async fn merge_edge(&mut self, from: &NodeRef, relation: Relation, to: &NodeRef)
        -> MemoryResult<()>;

    /// Set only the properties that are currently absent on an existing node
    ///
    /// Returns the number of properties written; a missing node writes nothing.
    async fn set_missing(&mut self, node: &NodeRef, properties: Properties) -> MemoryResult<usize>;

    /// Hold a write lock on an existing node until the transaction ends
    ///
    /// Stores that already serialize whole transactions need not override this.
    async fn lock_node(&mut self, _node: &NodeRef) -> MemoryResult<()> {
        Ok(())
    }

    /// Read a node
    async fn find_node(&mut self, node: &NodeRef) -> MemoryResult<Option<NodeRecord>>;

    /// Targets of outgoing edges of the given type, ordered by key
    async fn outgoing(&mut self, node: &NodeRef, relation: Relation)
        -> MemoryResult<Vec<NodeRecord>>;

    /// Make every write visible
    async fn commit(self: Box<Self>) -> MemoryResult<()>;

    /// Discard every write
    async fn rollback(self: Box<Self>) -> MemoryResult<()>;
}

/// A graph store with vector search
#[async_trait::async_trait]
pub trait GraphStore: Send + Sync {
    /// Backend name for logs
    fn backend_name(&self) -> &str;

    /// Apply one create-if-not-exists schema statement
    async fn run_schema(&self, statement: &SchemaStatement) -> MemoryResult<()>;

    /// Open a write transaction
    async fn begin(&self) -> MemoryResult<Box<dyn GraphTransaction>>;

    /// Read a committed node
    async fn find_node(&self, node: &NodeRef) -> MemoryResult<Option<NodeRecord>>;

    /// Committed targets of outgoing edges of the given type, ordered by key
    async fn outgoing(&self, node: &NodeRef, relation: Relation) -> MemoryResult<Vec<NodeRecord>>;

    /// Nodes of `label` whose text is set and whose embedding is not
    async fn pending_embeddings(&self, label: NodeLabel) -> MemoryResult<Vec<PendingContent>>;

    /// Sources with text and no outgoing `FIRST` edge
    async fn unchunked_sources(&self) -> MemoryResult<Vec<PendingContent>>;

    /// Top `limit` nodes of a vector index by similarity, best first
    async fn vector_search(
        &self,
        index: &str,
        vector: &[f32],
        limit: usize,
    ) -> MemoryResult<Vec<ScoredNode>>;

    /// Release connections
    async fn close(&self) -> MemoryResult<()> {
        Ok(())
    }
}
