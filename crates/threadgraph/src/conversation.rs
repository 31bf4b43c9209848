//! Conversation ingestion: turn batches into the thread graph
//!
//! A batch becomes User, Thread, Message, ToolCall and Source nodes in one
//! transaction. Messages form a single `FIRST`/`NEXT` chain per thread; tool
//! results hang off the reply that consumed them through `TRIGGERED` and never
//! enter the chain.

use crate::config::RetryPolicy;
use crate::error::{MemoryError, MemoryResult};
use crate::model::{NodeLabel, NodeRef, Relation, Role, Turn, TurnRecord};
use crate::retrieval::link_context;
use crate::sanitize::sanitize_turns;
use crate::store::{properties, GraphStore, GraphTransaction, PropertyValue};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What a committed batch touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Message records in the batch
    pub messages: usize,
    /// ToolCall records in the batch
    pub tool_calls: usize,
    /// Source entries seen across tool calls
    pub sources: usize,
    /// Nodes that did not exist before
    pub nodes_created: usize,
    /// `SOURCED` edges requested from context ids that resolved to a node
    pub context_links: usize,
    /// Commit attempts used
    pub attempts: u32,
}

/// Writes turn batches into the graph
pub struct ConversationWriter {
    store: Arc<dyn GraphStore>,
    retry: RetryPolicy,
    source_content_limit: usize,
}

impl ConversationWriter {
    /// Create a writer
    pub fn new(store: Arc<dyn GraphStore>, retry: RetryPolicy, source_content_limit: usize) -> Self {
        Self {
            store,
            retry,
            source_content_limit,
        }
    }

    /// Sanitize raw turns, then write them
    pub async fn write_turns(
        &self,
        user_id: &str,
        thread_id: &str,
        turns: &[Turn],
        context_ids: &[String],
    ) -> MemoryResult<WriteOutcome> {
        let records = sanitize_turns(thread_id, turns, self.source_content_limit);
        self.write_turn(user_id, thread_id, &records, context_ids).await
    }

    /// Persist a sanitized batch atomically
    ///
    /// Transient store failures are retried per the retry policy. Anything
    /// else, or retries running out, is reported as
    /// [`MemoryError::Persistence`] with the graph left as it was.
    #[instrument(skip(self, records, context_ids), fields(records = records.len()))]
    pub async fn write_turn(
        &self,
        user_id: &str,
        thread_id: &str,
        records: &[TurnRecord],
        context_ids: &[String],
    ) -> MemoryResult<WriteOutcome> {
        if user_id.trim().is_empty() {
            return Err(MemoryError::validation("user_id", "must not be empty", user_id));
        }
        if thread_id.trim().is_empty() {
            return Err(MemoryError::validation("thread_id", "must not be empty", thread_id));
        }
        if records.is_empty() {
            debug!(thread_id, "nothing to persist");
            return Ok(WriteOutcome::default());
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_write(user_id, thread_id, records, context_ids).await {
                Ok(mut outcome) => {
                    outcome.attempts = attempt;
                    info!(
                        thread_id,
                        messages = outcome.messages,
                        tool_calls = outcome.tool_calls,
                        created = outcome.nodes_created,
                        "saved conversation turn"
                    );
                    if outcome.context_links > 0 {
                        info!(thread_id, links = outcome.context_links, "linked retrieved context");
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(thread_id, attempt, error = %e, ?delay, "transient store error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(thread_id, attempt, error = %e, "failed to save conversation turn");
                    return Err(MemoryError::Persistence {
                        thread_id: thread_id.to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    async fn try_write(
        &self,
        user_id: &str,
        thread_id: &str,
        records: &[TurnRecord],
        context_ids: &[String],
    ) -> MemoryResult<WriteOutcome> {
        let mut tx = self.store.begin().await?;
        match apply_batch(tx.as_mut(), user_id, thread_id, records, context_ids).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
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

async fn apply_batch(
    tx: &mut dyn GraphTransaction,
    user_id: &str,
    thread_id: &str,
    records: &[TurnRecord],
    context_ids: &[String],
) -> MemoryResult<WriteOutcome> {
    let mut outcome = WriteOutcome::default();
    let now = Utc::now();

    let user = NodeRef::user(user_id);
    let thread = NodeRef::thread(thread_id);
    outcome.nodes_created += tx
        .merge_node(&user, properties([("created_at", Some(now.into()))]))
        .await? as usize;
    outcome.nodes_created += tx
        .merge_node(&thread, properties([("created_at", Some(now.into()))]))
        .await? as usize;
    tx.merge_edge(&user, Relation::ParticipatedIn, &thread).await?;
    tx.lock_node(&thread).await?;

    let mut chain = ChainCursor::new(thread);
    let mut prev: Option<&TurnRecord> = None;

    for record in records {
        match record.role {
            Role::Tool => {
                let tool_call = NodeRef::tool_call(&record.id);
                outcome.tool_calls += 1;
                outcome.nodes_created += tx
                    .merge_node(
                        &tool_call,
                        properties([
                            ("role", Some(PropertyValue::from(record.role.as_str()))),
                            ("index", Some(record.index.into())),
                            ("created_at", Some(now.into())),
                        ]),
                    )
                    .await? as usize;

                for source in record.sources.iter().flatten() {
                    let node = NodeRef::source(&source.url);
                    outcome.sources += 1;
                    outcome.nodes_created += tx
                        .merge_node(
                            &node,
                            properties([
                                ("title", Some(PropertyValue::from(source.title.as_str()))),
                                ("text", Some(PropertyValue::from(source.content.as_str()))),
                                ("crawled_at", Some(now.into())),
                            ]),
                        )
                        .await? as usize;
                    tx.merge_edge(&tool_call, Relation::Retrieved, &node).await?;
                }
            }
            Role::User | Role::Assistant | Role::System => {
                let message = NodeRef::message(&record.id);
                outcome.messages += 1;
                let created = tx
                    .merge_node(
                        &message,
                        properties([
                            ("role", Some(PropertyValue::from(record.role.as_str()))),
                            ("content", record.content.clone().map(PropertyValue::from)),
                            ("index", Some(record.index.into())),
                            ("created_at", Some(now.into())),
                        ]),
                    )
                    .await?;
                outcome.nodes_created += created as usize;

                if let Some(prev) = prev.filter(|p| p.role == Role::Tool) {
                    link_tool_result(tx, &message, &NodeRef::tool_call(&prev.id)).await?;
                }

                // an existing message was chained by the batch that created it
                if created {
                    chain.append(tx, &message).await?;
                }
            }
        }
        prev = Some(record);
    }

    if !context_ids.is_empty() {
        match records.iter().rev().find(|r| r.role == Role::Assistant) {
            Some(reply) => {
                outcome.context_links =
                    link_context(tx, &NodeRef::message(&reply.id), context_ids).await?;
            }
            None => debug!(thread_id, "no assistant message to attach retrieved context to"),
        }
    }

    Ok(outcome)
}

/// `TRIGGERED` from the reply to the tool call, plus `SOURCED` to its sources
async fn link_tool_result(
    tx: &mut dyn GraphTransaction,
    reply: &NodeRef,
    tool_call: &NodeRef,
) -> MemoryResult<()> {
    if tx.find_node(tool_call).await?.is_none() {
        return Ok(());
    }
    tx.merge_edge(reply, Relation::Triggered, tool_call).await?;
    for source in tx.outgoing(tool_call, Relation::Retrieved).await? {
        tx.merge_edge(reply, Relation::Sourced, &source.node).await?;
    }
    Ok(())
}

/// Tracks the tail of a thread's message chain within one transaction
struct ChainCursor {
    thread: NodeRef,
    tail: Option<NodeRef>,
    resolved: bool,
}

impl ChainCursor {
    fn new(thread: NodeRef) -> Self {
        Self {
            thread,
            tail: None,
            resolved: false,
        }
    }

    /// Attach `message` after the current tail, or as `FIRST` on an empty thread
    async fn append(&mut self, tx: &mut dyn GraphTransaction, message: &NodeRef) -> MemoryResult<()> {
        if !self.resolved {
            self.tail = find_chain_tail(tx, &self.thread).await?;
            self.resolved = true;
        }

        match &self.tail {
            Some(tail) => tx.merge_edge(tail, Relation::Next, message).await?,
            None => tx.merge_edge(&self.thread, Relation::First, message).await?,
        }
        self.tail = Some(message.clone());
        Ok(())
    }
}

/// Walk `FIRST` then `NEXT` to the last message of a thread
pub(crate) async fn find_chain_tail(
    tx: &mut dyn GraphTransaction,
    thread: &NodeRef,
) -> MemoryResult<Option<NodeRef>> {
    let Some(first) = tx
        .outgoing(thread, Relation::First)
        .await?
        .into_iter()
        .find(|n| n.label() == NodeLabel::Message)
    else {
        return Ok(None);
    };

    let mut visited = HashSet::new();
    let mut current = first.node;
    visited.insert(current.clone());

    loop {
        let next = tx
            .outgoing(&current, Relation::Next)
            .await?
            .into_iter()
            .find(|n| n.label() == NodeLabel::Message);
        match next {
            Some(next) if visited.insert(next.node.clone()) => current = next.node,
            Some(next) => {
                return Err(MemoryError::store(
                    "find_chain_tail",
                    format!("cycle in message chain of {} at {}", thread, next.node),
                ))
            }
            None => return Ok(Some(current)),
        }
    }
}
