//! # Conversation Memory Demo
//!
//! Walks an agent through two conversations that share a graph memory:
//!
//! - the first conversation uses a search tool and is ingested with its source
//! - background maintenance embeds the messages and chunks the source
//! - the second conversation asks the same question, retrieves the earlier
//!   exchange, and links its answer back to it
//!
//! ## Run This Example
//!
//! ```bash
//! cargo run --example conversation_memory_demo
//! # against Neo4j (NEO4J_URI, NEO4J_USERNAME, NEO4J_PASSWORD)
//! cargo run --example conversation_memory_demo --features neo4j
//! ```

use serde_json::json;
use std::sync::Arc;
use threadgraph::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DIMENSIONS: usize = 64;
const QUESTION: &str = "What is APOC?";

#[cfg(feature = "neo4j")]
async fn open_memory(config: MemoryConfig) -> anyhow::Result<GraphMemory> {
    let embedder = Arc::new(HashEmbeddingProvider::new(DIMENSIONS));
    match Neo4jConfig::from_env() {
        Ok(settings) => Ok(GraphMemory::connect_neo4j(&settings, embedder, config).await?),
        Err(e) => {
            info!("{}; falling back to the in-memory store", e);
            Ok(GraphMemory::open(Arc::new(InMemoryGraphStore::new()), embedder, config).await?)
        }
    }
}

#[cfg(not(feature = "neo4j"))]
async fn open_memory(config: MemoryConfig) -> anyhow::Result<GraphMemory> {
    let embedder = Arc::new(HashEmbeddingProvider::new(DIMENSIONS));
    Ok(GraphMemory::open(Arc::new(InMemoryGraphStore::new()), embedder, config).await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("=== Conversation Memory Demo ===\n");

    let config = MemoryConfig::from_env()?.with_embedding_dimensions(DIMENSIONS);
    let memory = open_memory(config).await?;
    info!(
        "Schema: {} statements applied, {} warnings",
        memory.schema_report().applied.len(),
        memory.schema_report().warnings.len()
    );
    memory.start_maintenance().await;

    // 1. First conversation: nothing to remember yet, the agent calls a tool
    let first_thread = generate_thread_id();
    let context = memory.retrieve(QUESTION).await;
    info!("Context before any conversation: {} items", context.items.len());

    let outcome = memory
        .write_turn(
            "ada@example.com",
            &first_thread,
            &[
                Turn::user(QUESTION),
                Turn::tool(json!([{
                    "url": "https://neo4j.com/docs/apoc",
                    "title": "APOC",
                    "content": "APOC is a library of procedures and functions for Neo4j. \
                                It covers data integration, graph algorithms and conversions."
                }])),
                Turn::assistant("APOC is Neo4j's standard library of procedures."),
            ],
            &context.context_ids(),
        )
        .await?;
    info!(
        "Saved thread {}: {} messages, {} tool calls, {} sources",
        first_thread, outcome.messages, outcome.tool_calls, outcome.sources
    );

    // 2. Maintenance embeds messages and chunks the new source
    let report = memory.run_maintenance_in_background().await?;
    info!(
        "Maintenance: {} messages embedded, {} sources chunked into {} chunks",
        report.messages_embedded, report.sources_chunked, report.chunks_created
    );

    // 3. Second conversation: the same question now hits memory
    let second_thread = generate_thread_id();
    let context = memory.retrieve(QUESTION).await;
    match context.to_system_prompt() {
        Some(prompt) => info!("Injected system prompt:\n{}\n", prompt),
        None => info!("No internal knowledge found"),
    }

    let outcome = memory
        .write_turn(
            "grace@example.com",
            &second_thread,
            &[
                Turn::user(QUESTION),
                Turn::assistant("As discussed before, APOC is Neo4j's standard library."),
            ],
            &context.context_ids(),
        )
        .await?;
    info!("Linked {} retrieved items to the new answer", outcome.context_links);

    memory.close().await?;
    info!("\n=== Demo Complete ===");
    Ok(())
}
