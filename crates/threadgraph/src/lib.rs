//! # Threadgraph - Conversation Graph Memory for Agents
//!
//! **Threadgraph** stores agent conversations as a graph and brings the
//! relevant parts back before the agent answers:
//!
//! - **Ingestion**: every turn batch becomes User, Thread, Message, ToolCall
//!   and Source nodes, written atomically and idempotently
//! - **Maintenance**: background embedding of messages and chunking of sources
//! - **Retrieval**: threshold-gated vector lookup over messages and chunks,
//!   expanded to the sources a past answer was grounded on
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use threadgraph::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MemoryConfig::new().with_embedding_dimensions(64);
//!     let memory = GraphMemory::open(
//!         Arc::new(InMemoryGraphStore::new()),
//!         Arc::new(HashEmbeddingProvider::new(64)),
//!         config,
//!     )
//!     .await?;
//!
//!     let context = memory.retrieve("How do I install APOC?").await;
//!     let thread_id = generate_thread_id();
//!     memory
//!         .write_turn(
//!             "ada@example.com",
//!             &thread_id,
//!             &[Turn::user("How do I install APOC?"), Turn::assistant("Copy the jar into plugins.")],
//!             &context.context_ids(),
//!         )
//!         .await?;
//!
//!     memory.run_maintenance().await?;
//!     memory.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Graph Shape
//!
//! ```text
//! (User)-[:PARTICIPATED_IN]->(Thread)-[:FIRST]->(Message)-[:NEXT]->(Message)
//!                                                   |
//!                                   [:TRIGGERED]    |    [:SOURCED]
//!                                  (ToolCall) <-----+-----> (Source | Chunk | Message)
//!                                      |
//!                                [:RETRIEVED]
//!                                      v
//!                                  (Source)-[:FIRST]->(Chunk)-[:NEXT]->(Chunk)
//! ```
//!
//! ## Backends
//!
//! [`store::InMemoryGraphStore`] is always available. Enable the `neo4j`
//! feature for the Neo4j backend:
//!
//! ```toml
//! [dependencies]
//! threadgraph = { version = "0.1", features = ["neo4j"] }
//! ```

#![doc(html_root_url = "https://docs.rs/threadgraph/0.1.0")]
#![warn(missing_docs)]

pub mod chunking;
pub mod config;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod maintenance;
pub mod manager;
pub mod model;
pub mod retrieval;
pub mod sanitize;
pub mod schema;
pub mod store;

pub use error::{MemoryError, MemoryResult};
pub use manager::{generate_thread_id, GraphMemory};

/// Commonly used types and traits
pub mod prelude {
    pub use crate::chunking::{RecursiveTextSplitter, TextSplitter};
    pub use crate::config::{MemoryConfig, RetryPolicy};
    pub use crate::conversation::{ConversationWriter, WriteOutcome};
    pub use crate::embedding::{EmbeddingProvider, HashEmbeddingProvider};
    pub use crate::error::{MemoryError, MemoryResult};
    pub use crate::maintenance::{
        MaintenanceHandle, MaintenanceReport, MaintenanceScheduler, MaintenanceStatus,
        MaintenanceTrigger, MaintenanceWorker,
    };
    pub use crate::manager::{generate_thread_id, GraphMemory};
    pub use crate::model::{Content, NodeLabel, NodeRef, Relation, Role, Turn};
    pub use crate::retrieval::{ContextItem, LinkBackWriter, RetrievedContext, Retriever};
    pub use crate::store::{GraphStore, InMemoryGraphStore};

    #[cfg(feature = "neo4j")]
    pub use crate::config::Neo4jConfig;
    #[cfg(feature = "neo4j")]
    pub use crate::store::Neo4jGraphStore;
}
