//! Memory configuration for the conversation graph

use crate::error::{MemoryError, MemoryResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment prefix used by [`MemoryConfig::from_env`]
pub const ENV_PREFIX: &str = "THREADGRAPH";

/// Tunables for ingestion, maintenance and retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Fixed dimension of every stored vector
    pub embedding_dimensions: usize,

    /// Texts per embedding request and vectors per write transaction
    pub embedding_batch_size: usize,

    /// Chunk window, in characters
    pub chunk_size: usize,

    /// Characters shared by consecutive chunks
    pub chunk_overlap: usize,

    /// Candidates fetched from each vector index
    pub retrieval_top_k: usize,

    /// A hit is kept only when `score > 1 - similarity_epsilon`
    pub similarity_epsilon: f32,

    /// Cap on the text stored on a Source node at ingestion time
    pub source_content_limit: usize,

    /// Retry policy for transient store errors
    pub retry: RetryPolicy,

    /// Run maintenance on a timer in addition to per-turn triggers
    pub maintenance_interval_secs: Option<u64>,
}

impl MemoryConfig {
    /// Create a configuration with the reference defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a `.env` file (if any) and overlay `THREADGRAPH_*` environment variables
    ///
    /// Nested keys use a double underscore, e.g. `THREADGRAPH_RETRY__MAX_ATTEMPTS=5`.
    pub fn from_env() -> MemoryResult<Self> {
        dotenv::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| MemoryError::configuration(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| MemoryError::configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Set the embedding dimensions
    pub fn with_embedding_dimensions(mut self, dimensions: usize) -> Self {
        self.embedding_dimensions = dimensions;
        self
    }

    /// Set the embedding batch size
    pub fn with_embedding_batch_size(mut self, batch_size: usize) -> Self {
        self.embedding_batch_size = batch_size;
        self
    }

    /// Set chunk window and overlap
    pub fn with_chunking(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_overlap = chunk_overlap;
        self
    }

    /// Set per-index top-K
    pub fn with_retrieval_top_k(mut self, top_k: usize) -> Self {
        self.retrieval_top_k = top_k;
        self
    }

    /// Set the similarity tolerance
    pub fn with_similarity_epsilon(mut self, epsilon: f32) -> Self {
        self.similarity_epsilon = epsilon;
        self
    }

    /// Set the Source text cap
    pub fn with_source_content_limit(mut self, limit: usize) -> Self {
        self.source_content_limit = limit;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run maintenance periodically
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval_secs = Some(interval.as_secs().max(1));
        self
    }

    /// Minimum similarity score a vector hit must exceed
    pub fn similarity_threshold(&self) -> f32 {
        1.0 - self.similarity_epsilon
    }

    /// Check the configuration for impossible values
    pub fn validate(&self) -> MemoryResult<()> {
        if self.embedding_dimensions == 0 {
            return Err(MemoryError::configuration("embedding_dimensions must be positive"));
        }
        if self.embedding_batch_size == 0 {
            return Err(MemoryError::configuration("embedding_batch_size must be positive"));
        }
        if self.chunk_size == 0 {
            return Err(MemoryError::configuration("chunk_size must be positive"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(MemoryError::configuration(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.retrieval_top_k == 0 {
            return Err(MemoryError::configuration("retrieval_top_k must be positive"));
        }
        if !(self.similarity_epsilon > 0.0 && self.similarity_epsilon <= 1.0) {
            return Err(MemoryError::configuration(format!(
                "similarity_epsilon must be in (0, 1], got {}",
                self.similarity_epsilon
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(MemoryError::configuration("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            embedding_dimensions: 384,
            embedding_batch_size: 50,
            chunk_size: 1000,
            chunk_overlap: 200,
            retrieval_top_k: 3,
            similarity_epsilon: 0.1,
            source_content_limit: 500,
            retry: RetryPolicy::default(),
            maintenance_interval_secs: None,
        }
    }
}

/// Jittered exponential backoff for transient store errors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound for a single delay, in milliseconds
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay_ms.max(self.base_delay_ms));
        // up to 25% jitter so concurrent writers on one thread spread out
        let jitter = fastrand::u64(0..=capped / 4);
        Duration::from_millis(capped - capped / 4 + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

/// Connection settings for the Neo4j backend
#[cfg(feature = "neo4j")]
#[derive(Debug, Clone)]
pub struct Neo4jConfig {
    /// Bolt URI, e.g. `neo4j+s://xxxx.databases.neo4j.io`
    pub uri: String,
    /// Username
    pub username: String,
    /// Password
    pub password: String,
    /// Database every query runs against
    pub database: String,
}

#[cfg(feature = "neo4j")]
impl Neo4jConfig {
    /// Read `NEO4J_URI`, `NEO4J_USERNAME`, `NEO4J_PASSWORD` and optional `NEO4J_DB`
    pub fn from_env() -> MemoryResult<Self> {
        dotenv::dotenv().ok();

        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let uri = read("NEO4J_URI");
        let username = read("NEO4J_USERNAME");
        let password = read("NEO4J_PASSWORD");

        match (uri, username, password) {
            (Some(uri), Some(username), Some(password)) => Ok(Self {
                uri,
                username,
                password,
                database: read("NEO4J_DB").unwrap_or_else(|| "neo4j".to_string()),
            }),
            _ => Err(MemoryError::configuration(
                "missing Neo4j environment variables (NEO4J_URI, NEO4J_USERNAME, NEO4J_PASSWORD)",
            )),
        }
    }
}
