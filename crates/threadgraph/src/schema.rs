//! Graph schema: uniqueness constraints, scalar indexes and vector indexes
//!
//! Every statement is create-if-not-exists, so the whole set is applied on
//! each startup. A failing statement is reported as a warning and never stops
//! the remaining ones.

use crate::model::NodeLabel;
use crate::store::GraphStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Vector index over `Message.embedding`
pub const MESSAGE_VECTOR_INDEX: &str = "messageContent_vector_idx";

/// Vector index over `Chunk.embedding`
pub const CHUNK_VECTOR_INDEX: &str = "chunkContent_vector_idx";

/// Property that stores vectors
pub const EMBEDDING_PROPERTY: &str = "embedding";

/// One idempotent schema statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaStatement {
    /// Uniqueness constraint on a node key
    Unique {
        /// Constraint name
        name: String,
        /// Constrained label
        label: NodeLabel,
        /// Key property
        property: String,
    },
    /// Scalar (range) index
    Range {
        /// Index name
        name: String,
        /// Indexed label
        label: NodeLabel,
        /// Indexed property
        property: String,
    },
    /// Cosine-similarity vector index
    Vector {
        /// Index name
        name: String,
        /// Indexed label
        label: NodeLabel,
        /// Vector property
        property: String,
        /// Fixed dimension
        dimensions: usize,
    },
}

impl SchemaStatement {
    /// Uniqueness constraint on the label's key property
    pub fn unique(name: impl Into<String>, label: NodeLabel) -> Self {
        SchemaStatement::Unique {
            name: name.into(),
            label,
            property: label.key_property().to_string(),
        }
    }

    /// Range index
    pub fn range(name: impl Into<String>, label: NodeLabel, property: impl Into<String>) -> Self {
        SchemaStatement::Range {
            name: name.into(),
            label,
            property: property.into(),
        }
    }

    /// Vector index on `embedding`
    pub fn vector(name: impl Into<String>, label: NodeLabel, dimensions: usize) -> Self {
        SchemaStatement::Vector {
            name: name.into(),
            label,
            property: EMBEDDING_PROPERTY.to_string(),
            dimensions,
        }
    }

    /// Constraint or index name
    pub fn name(&self) -> &str {
        match self {
            SchemaStatement::Unique { name, .. }
            | SchemaStatement::Range { name, .. }
            | SchemaStatement::Vector { name, .. } => name,
        }
    }

    /// Cypher rendering
    pub fn to_cypher(&self) -> String {
        match self {
            SchemaStatement::Unique {
                name,
                label,
                property,
            } => format!(
                "CREATE CONSTRAINT {} IF NOT EXISTS FOR (n:{}) REQUIRE n.{} IS UNIQUE",
                name, label, property
            ),
            SchemaStatement::Range {
                name,
                label,
                property,
            } => format!(
                "CREATE INDEX {} IF NOT EXISTS FOR (n:{}) ON (n.{})",
                name, label, property
            ),
            SchemaStatement::Vector {
                name,
                label,
                property,
                dimensions,
            } => format!(
                "CREATE VECTOR INDEX {} IF NOT EXISTS FOR (n:{}) ON (n.{}) \
                 OPTIONS {{indexConfig: {{`vector.similarity_function`: 'cosine', `vector.dimensions`: {}}}}}",
                name, label, property, dimensions
            ),
        }
    }
}

/// The conversation graph schema for a given vector dimension
pub fn conversation_schema(dimensions: usize) -> Vec<SchemaStatement> {
    vec![
        SchemaStatement::unique("userEmail_key", NodeLabel::User),
        SchemaStatement::unique("threadId_key", NodeLabel::Thread),
        SchemaStatement::unique("msgId_key", NodeLabel::Message),
        SchemaStatement::unique("toolCallId_key", NodeLabel::ToolCall),
        SchemaStatement::unique("sourceUrl_key", NodeLabel::Source),
        SchemaStatement::unique("chunkId_key", NodeLabel::Chunk),
        SchemaStatement::range("msgTimestamp_idx", NodeLabel::Message, "created_at"),
        SchemaStatement::range("sourceCrawled_idx", NodeLabel::Source, "crawled_at"),
        SchemaStatement::vector(MESSAGE_VECTOR_INDEX, NodeLabel::Message, dimensions),
        SchemaStatement::vector(CHUNK_VECTOR_INDEX, NodeLabel::Chunk, dimensions),
    ]
}

/// Outcome of a schema pass
#[derive(Debug, Clone, Default)]
pub struct SchemaReport {
    /// Statements that succeeded
    pub applied: Vec<String>,
    /// `(statement name, error)` for statements that failed
    pub warnings: Vec<(String, String)>,
}

impl SchemaReport {
    /// Whether every statement succeeded
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Applies the schema to a store
pub struct SchemaManager {
    store: Arc<dyn GraphStore>,
    statements: Vec<SchemaStatement>,
}

impl SchemaManager {
    /// Manager for the standard conversation schema
    pub fn new(store: Arc<dyn GraphStore>, dimensions: usize) -> Self {
        Self {
            store,
            statements: conversation_schema(dimensions),
        }
    }

    /// Manager for an explicit statement list
    pub fn with_statements(store: Arc<dyn GraphStore>, statements: Vec<SchemaStatement>) -> Self {
        Self { store, statements }
    }

    /// Statements this manager applies
    pub fn statements(&self) -> &[SchemaStatement] {
        &self.statements
    }

    /// Run every statement; failures are logged and collected
    pub async fn apply(&self) -> SchemaReport {
        let mut report = SchemaReport::default();

        for statement in &self.statements {
            match self.store.run_schema(statement).await {
                Ok(()) => report.applied.push(statement.name().to_string()),
                Err(e) => {
                    warn!(statement = statement.name(), error = %e, "schema warning");
                    report
                        .warnings
                        .push((statement.name().to_string(), e.to_string()));
                }
            }
        }

        info!(
            backend = self.store.backend_name(),
            applied = report.applied.len(),
            warnings = report.warnings.len(),
            "schema applied"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGraphStore;

    #[test]
    fn test_conversation_schema_shape() {
        let statements = conversation_schema(384);
        assert_eq!(statements.len(), 10);

        let vectors: Vec<_> = statements
            .iter()
            .filter(|s| matches!(s, SchemaStatement::Vector { .. }))
            .collect();
        assert_eq!(vectors.len(), 2);

        let cypher = statements[0].to_cypher();
        assert_eq!(
            cypher,
            "CREATE CONSTRAINT userEmail_key IF NOT EXISTS FOR (n:User) REQUIRE n.email IS UNIQUE"
        );
        assert!(statements[8].to_cypher().contains("`vector.dimensions`: 384"));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = Arc::new(InMemoryGraphStore::new());
        let manager = SchemaManager::new(store.clone(), 8);

        let first = manager.apply().await;
        assert!(first.is_clean());
        assert_eq!(first.applied.len(), 10);

        let second = manager.apply().await;
        assert!(second.is_clean());
        assert_eq!(second.applied.len(), 10);
    }

    #[tokio::test]
    async fn test_failed_statement_does_not_abort_the_rest() {
        let store = Arc::new(InMemoryGraphStore::new());
        SchemaManager::new(store.clone(), 8).apply().await;

        // same index name, conflicting definition
        let manager = SchemaManager::with_statements(
            store,
            vec![
                SchemaStatement::vector(MESSAGE_VECTOR_INDEX, NodeLabel::Message, 16),
                SchemaStatement::range("chunkIndex_idx", NodeLabel::Chunk, "index"),
            ],
        );

        let report = manager.apply().await;
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].0, MESSAGE_VECTOR_INDEX);
        assert_eq!(report.applied, vec!["chunkIndex_idx".to_string()]);
    }
}
