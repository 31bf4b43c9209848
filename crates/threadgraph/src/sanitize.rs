//! Identity derivation and payload sanitization
//!
//! Turns arrive with heterogeneous payloads (plain strings, streamed block
//! lists, provider mappings, JSON-encoded tool results). Everything here is
//! pure: the same batch always yields the same records and ids, which is what
//! makes re-ingestion idempotent at the store layer.

use crate::error::{MemoryError, MemoryResult};
use crate::model::{Content, ContentBlock, Role, SourceDocument, Turn, TurnRecord};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::warn;

/// Characters of content folded into a derived id
const ID_CONTENT_PREFIX: usize = 50;

/// Title stored when a source carries none
const UNTITLED: &str = "No Title";

/// Flatten any payload variant into plain text
pub fn normalize_content(content: &Content) -> String {
    match content {
        Content::Text(text) => text.clone(),
        Content::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(text.clone()),
                ContentBlock::Fields(fields) => fields.get("text").map(value_to_text),
            })
            .collect(),
        Content::Raw(fields) => match fields.get("text") {
            Some(text) => value_to_text(text),
            None => canonical_json(fields),
        },
    }
}

/// Pull `{url, title, content}` entries out of a tool result
///
/// Unparsable payloads yield an empty list; entries without a `url` are
/// skipped. Content is normalized and capped at `content_limit` characters.
pub fn extract_sources(payload: &Content, content_limit: usize) -> Vec<SourceDocument> {
    let entries: Vec<Map<String, Value>> = match payload {
        Content::Text(text) => match parse_tool_entries(text) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "no sources extracted from tool payload");
                Vec::new()
            }
        },
        Content::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Fields(fields) => Some(fields.clone()),
                ContentBlock::Text(_) => None,
            })
            .collect(),
        Content::Raw(fields) => vec![fields.clone()],
    };

    entries
        .into_iter()
        .filter_map(|fields| {
            let url = match fields.get("url") {
                None | Some(Value::Null) => return None,
                Some(url) => value_to_text(url),
            };
            let title = fields
                .get("title")
                .filter(|t| !t.is_null())
                .map(value_to_text)
                .unwrap_or_else(|| UNTITLED.to_string());
            let content = fields
                .get("content")
                .cloned()
                .map(|c| normalize_content(&Content::from(c)))
                .unwrap_or_default();

            Some(SourceDocument {
                url,
                title,
                content: truncate_chars(&content, content_limit),
            })
        })
        .collect()
}

/// Decode a JSON-encoded tool result into its object entries
fn parse_tool_entries(text: &str) -> MemoryResult<Vec<Map<String, Value>>> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(fields) => Some(fields),
                _ => None,
            })
            .collect()),
        Value::Object(fields) => Ok(vec![fields]),
        other => Err(MemoryError::MalformedPayload(format!(
            "expected an object or a list of objects, got {}",
            truncate_chars(&other.to_string(), 80)
        ))),
    }
}

/// Deterministic message id: hash of thread, position, role and content prefix
pub fn derive_message_id(thread_id: &str, index: usize, role: Role, content: &str) -> String {
    let prefix: String = content.chars().take(ID_CONTENT_PREFIX).collect();
    let raw = format!("{}-{}-{}-{}", thread_id, index, role, prefix);
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

/// Sanitize a turn batch into writable records
///
/// System turns are dropped. Turns whose text normalizes to whitespace are
/// dropped unless they are tool results that still carry sources. Dropped
/// turns do not advance the index.
pub fn sanitize_turns(thread_id: &str, turns: &[Turn], source_content_limit: usize) -> Vec<TurnRecord> {
    let mut records = Vec::with_capacity(turns.len());
    let mut index = 0;

    for turn in turns {
        if turn.role == Role::System {
            continue;
        }

        let text = normalize_content(&turn.content);
        let sources = match turn.role {
            Role::Tool => Some(extract_sources(&turn.content, source_content_limit)),
            _ => None,
        };

        let has_sources = sources.as_ref().is_some_and(|s| !s.is_empty());
        if text.trim().is_empty() && !has_sources {
            continue;
        }

        let id = turn
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| derive_message_id(thread_id, index, turn.role, &text));

        records.push(TurnRecord {
            id,
            index,
            role: turn.role,
            content: match turn.role {
                Role::User | Role::Assistant => Some(text),
                Role::Tool | Role::System => None,
            },
            sources,
        });
        index += 1;
    }

    records
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn canonical_json(fields: &Map<String, Value>) -> String {
    let ordered: BTreeMap<&String, &Value> = fields.iter().collect();
    serde_json::to_string(&ordered).unwrap_or_default()
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
