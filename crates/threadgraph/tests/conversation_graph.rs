use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use threadgraph::prelude::*;
use threadgraph::schema::MESSAGE_VECTOR_INDEX;

const DIMS: usize = 32;

async fn open(store: &Arc<InMemoryGraphStore>, config: MemoryConfig) -> GraphMemory {
    GraphMemory::open(
        store.clone(),
        Arc::new(HashEmbeddingProvider::new(DIMS)),
        config.with_embedding_dimensions(DIMS),
    )
    .await
    .unwrap()
}

fn apoc_batch() -> Vec<Turn> {
    vec![
        Turn::user("What is APOC?"),
        Turn::tool(json!({
            "url": "https://neo4j.com/docs/apoc",
            "title": "APOC",
            "content": "APOC is a library..."
        })),
        Turn::assistant("APOC is Neo4j's standard library."),
    ]
}

/// Message keys in chain order
async fn chain(store: &InMemoryGraphStore, thread_id: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut next = store
        .outgoing(&NodeRef::thread(thread_id), Relation::First)
        .await
        .unwrap();
    while let Some(node) = next.pop() {
        assert!(next.is_empty(), "chain branches at {}", node.node);
        keys.push(node.key().to_string());
        next = store.outgoing(&node.node, Relation::Next).await.unwrap();
    }
    keys
}

#[tokio::test]
async fn test_apoc_conversation_graph_shape() {
    let store = Arc::new(InMemoryGraphStore::new());
    let memory = open(&store, MemoryConfig::new()).await;

    memory.write_turn("u@x.com", "T1", &apoc_batch(), &[]).await.unwrap();

    let stats = store.stats().await;
    assert_eq!(stats.nodes(NodeLabel::User), 1);
    assert_eq!(stats.nodes(NodeLabel::Thread), 1);
    assert_eq!(stats.nodes(NodeLabel::Message), 2);
    assert_eq!(stats.nodes(NodeLabel::ToolCall), 1);
    assert_eq!(stats.nodes(NodeLabel::Source), 1);
    assert_eq!(stats.edges(Relation::ParticipatedIn), 1);
    assert_eq!(stats.edges(Relation::First), 1);
    assert_eq!(stats.edges(Relation::Next), 1);

    let source = &store.nodes(NodeLabel::Source).await[0];
    assert_eq!(source.key(), "https://neo4j.com/docs/apoc");
    assert_eq!(source.text("title"), Some("APOC"));

    let messages = chain(&store, "T1").await;
    assert_eq!(messages.len(), 2);
    let user = store.find_node(&NodeRef::message(&messages[0])).await.unwrap().unwrap();
    let reply = store.find_node(&NodeRef::message(&messages[1])).await.unwrap().unwrap();
    assert_eq!(user.text("role"), Some("user"));
    assert_eq!(user.content(), Some("What is APOC?"));
    assert_eq!(reply.text("role"), Some("assistant"));

    let triggered = store.outgoing(&reply.node, Relation::Triggered).await.unwrap();
    assert_eq!(triggered.len(), 1);
    assert_eq!(triggered[0].label(), NodeLabel::ToolCall);
    assert_eq!(triggered[0].content(), None);

    let sourced = store.outgoing(&reply.node, Relation::Sourced).await.unwrap();
    assert_eq!(sourced.len(), 1);
    assert_eq!(sourced[0].node, source.node);

    let retrieved = store.outgoing(&triggered[0].node, Relation::Retrieved).await.unwrap();
    assert_eq!(retrieved[0].node, source.node);
}

#[tokio::test]
async fn test_identical_batch_is_idempotent() {
    let store = Arc::new(InMemoryGraphStore::new());
    let memory = open(&store, MemoryConfig::new()).await;

    memory.write_turn("u@x.com", "T1", &apoc_batch(), &[]).await.unwrap();
    let once = store.stats().await;

    let outcome = memory.write_turn("u@x.com", "T1", &apoc_batch(), &[]).await.unwrap();
    assert_eq!(outcome.nodes_created, 0);
    assert_eq!(store.stats().await, once);
}

#[tokio::test]
async fn test_chain_visits_every_message_in_order() {
    let store = Arc::new(InMemoryGraphStore::new());
    let memory = open(&store, MemoryConfig::new()).await;

    let mut history = Vec::new();
    for i in 0..4 {
        history.push(Turn::user(format!("question {}", i)).with_id(format!("q{}", i)));
        history.push(Turn::assistant(format!("answer {}", i)).with_id(format!("a{}", i)));
        // each invocation carries the whole history so far
        memory.write_turn("u@x.com", "T1", &history, &[]).await.unwrap();
    }

    let expected: Vec<String> = (0..4)
        .flat_map(|i| [format!("q{}", i), format!("a{}", i)])
        .collect();
    assert_eq!(chain(&store, "T1").await, expected);
    assert_eq!(store.stats().await.edges(Relation::Next), expected.len() - 1);
}

#[tokio::test]
async fn test_concurrent_writers_keep_a_single_chain() {
    let store = Arc::new(InMemoryGraphStore::new());
    let memory = Arc::new(open(&store, MemoryConfig::new()).await);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let memory = memory.clone();
        tasks.push(tokio::spawn(async move {
            memory
                .write_turn("u@x.com", "T1", &[Turn::user(format!("message {}", i)).with_id(format!("m{}", i))], &[])
                .await
                .map(|_| ())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let keys = chain(&store, "T1").await;
    assert_eq!(keys.len(), 8);
    assert_eq!(keys.iter().collect::<HashSet<_>>().len(), 8);
}

#[tokio::test]
async fn test_maintenance_converges_and_enables_retrieval() {
    let store = Arc::new(InMemoryGraphStore::new());
    let memory = open(&store, MemoryConfig::new().with_chunking(200, 40)).await;

    let page = (0..20)
        .map(|i| format!("Procedure number {} is part of the APOC library.", i))
        .collect::<Vec<_>>()
        .join(" ");
    let batch = vec![
        Turn::user("List APOC procedures"),
        Turn::tool(json!([{ "url": "https://apoc/procs", "title": "Procs", "content": page }])),
        Turn::assistant("Here are some procedures."),
    ];
    memory.write_turn("u@x.com", "T1", &batch, &[]).await.unwrap();

    let report = memory.run_maintenance().await.unwrap();
    assert_eq!(report.messages_embedded, 2);
    assert_eq!(report.sources_chunked, 1);

    for message in store.nodes(NodeLabel::Message).await {
        assert!(message.embedding().is_some());
    }
    let chunks = store.nodes(NodeLabel::Chunk).await;
    assert_eq!(chunks.len(), report.chunks_created);
    assert!(chunks.len() > 1);
    assert_eq!(store.stats().await.edges(Relation::Next), 1 + chunks.len() - 1);

    let converged = store.stats().await;
    assert!(memory.run_maintenance().await.unwrap().is_idle());
    assert_eq!(store.stats().await, converged);

    // asking the same question again finds the message and its grounding chunks
    let context = memory.retrieve("List APOC procedures").await;
    assert_eq!(context.items[0].content, "List APOC procedures");
    assert!(context.items.iter().any(|item| item.id == "https://apoc/procs_0"));
}

#[tokio::test]
async fn test_retrieval_threshold() {
    let store = Arc::new(InMemoryGraphStore::new());
    let memory = open(&store, MemoryConfig::new()).await;

    memory
        .write_turn("u@x.com", "T1", &[Turn::user("stored question").with_id("m1")], &[])
        .await
        .unwrap();
    memory.run_maintenance().await.unwrap();

    let stored = store
        .find_node(&NodeRef::message("m1"))
        .await
        .unwrap()
        .unwrap()
        .embedding()
        .unwrap()
        .to_vec();
    let context = memory.retrieve_vector(&stored).await;
    assert_eq!(context.context_ids(), vec!["m1"]);

    let opposite: Vec<f32> = stored.iter().map(|x| -x).collect();
    assert!(memory.retrieve_vector(&opposite).await.is_empty());

    let hits = store.vector_search(MESSAGE_VECTOR_INDEX, &opposite, 3).await.unwrap();
    assert!(hits[0].score < memory.config().similarity_threshold());
}

#[tokio::test]
async fn test_retrieved_context_is_linked_back() {
    let store = Arc::new(InMemoryGraphStore::new());
    let memory = open(&store, MemoryConfig::new()).await;

    memory
        .write_turn("u@x.com", "T1", &[Turn::user("How do I install APOC?").with_id("old")], &[])
        .await
        .unwrap();
    memory.run_maintenance().await.unwrap();

    let context = memory.retrieve("How do I install APOC?").await;
    assert_eq!(context.context_ids(), vec!["old"]);
    assert!(context.to_system_prompt().unwrap().contains("How do I install APOC?"));

    let batch = [
        Turn::user("How do I install APOC?").with_id("new-q"),
        Turn::assistant("Drop the jar into plugins.").with_id("new-a"),
    ];
    let outcome = memory
        .write_turn("u@x.com", "T2", &batch, &context.context_ids())
        .await
        .unwrap();
    assert_eq!(outcome.context_links, 1);

    let linked = store.outgoing(&NodeRef::message("new-a"), Relation::Sourced).await.unwrap();
    assert_eq!(linked[0].key(), "old");
}

#[tokio::test]
async fn test_failed_commit_leaves_graph_unchanged() {
    let store = Arc::new(InMemoryGraphStore::new());
    let memory = open(&store, MemoryConfig::new().with_retry(RetryPolicy::none())).await;

    store.fail_next_commits(1);
    let err = memory.write_turn("u@x.com", "T1", &apoc_batch(), &[]).await.unwrap_err();
    assert!(matches!(err, MemoryError::Persistence { attempts: 1, .. }));
    assert_eq!(store.stats().await.total_nodes(), 0);

    memory.write_turn("u@x.com", "T1", &apoc_batch(), &[]).await.unwrap();
    assert_eq!(store.stats().await.total_nodes(), 6);
}

/// Refuses any text mentioning `BLOCKED`, like a provider content filter
struct FilteringEmbedder(HashEmbeddingProvider);

#[async_trait::async_trait]
impl EmbeddingProvider for FilteringEmbedder {
    async fn embed_one(&self, text: &str) -> MemoryResult<Vec<f32>> {
        if text.contains("BLOCKED") {
            return Err(MemoryError::Embedding("input rejected".to_string()));
        }
        self.0.embed_one(text).await
    }

    fn model_name(&self) -> &str {
        "filtering"
    }

    fn dimensions(&self) -> usize {
        DIMS
    }
}

#[tokio::test]
async fn test_rejected_message_does_not_stall_maintenance() {
    let store = Arc::new(InMemoryGraphStore::new());
    let memory = GraphMemory::open(
        store.clone(),
        Arc::new(FilteringEmbedder(HashEmbeddingProvider::new(DIMS))),
        MemoryConfig::new().with_embedding_dimensions(DIMS),
    )
    .await
    .unwrap();

    let batch = vec![
        Turn::user("BLOCKED question"),
        Turn::tool(json!({ "url": "https://good", "title": "Good", "content": "a healthy page" })),
        Turn::assistant("fine answer").with_id("answer"),
    ];
    memory.write_turn("u@x.com", "T1", &batch, &[]).await.unwrap();

    for _ in 0..3 {
        let report = memory.run_maintenance().await.unwrap();
        assert_eq!(report.failed, 1);
    }

    let chunks = store.nodes(NodeLabel::Chunk).await;
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].embedding().is_some());
    let answer = store.find_node(&NodeRef::message("answer")).await.unwrap().unwrap();
    assert!(answer.embedding().is_some());
}
