//! Conversation data model: turns, payloads, and the graph vocabulary

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Author of a turn, decided once at the ingestion boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End user
    User,
    /// The agent
    Assistant,
    /// Result of a tool invocation
    Tool,
    /// System prompt; never persisted
    System,
}

impl Role {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }

    /// Parse a wire name
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of a block-list payload
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    /// Bare string element
    Text(String),
    /// Mapping element; only its `text` field is conversational
    Fields(Map<String, Value>),
}

/// Message payload as produced by heterogeneous LLM and tool outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Content {
    /// Plain text
    Text(String),
    /// Sequence of strings and mappings (streamed or multi-part outputs)
    Blocks(Vec<ContentBlock>),
    /// A single mapping (tool-call payloads, provider metadata)
    Raw(Map<String, Value>),
}

impl Content {
    /// Empty text payload
    pub fn empty() -> Self {
        Content::Text(String::new())
    }
}

impl From<Value> for Content {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Content::Text(text),
            Value::Array(items) => Content::Blocks(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(text) => Some(ContentBlock::Text(text)),
                        Value::Object(fields) => Some(ContentBlock::Fields(fields)),
                        _ => None,
                    })
                    .collect(),
            ),
            Value::Object(fields) => Content::Raw(fields),
            Value::Null => Content::empty(),
            other => Content::Text(other.to_string()),
        }
    }
}

impl From<Content> for Value {
    fn from(content: Content) -> Self {
        match content {
            Content::Text(text) => Value::String(text),
            Content::Blocks(blocks) => Value::Array(
                blocks
                    .into_iter()
                    .map(|block| match block {
                        ContentBlock::Text(text) => Value::String(text),
                        ContentBlock::Fields(fields) => Value::Object(fields),
                    })
                    .collect(),
            ),
            Content::Raw(fields) => Value::Object(fields),
        }
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

/// A raw conversation turn handed to the writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Stable id supplied by the agent runtime, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Author
    pub role: Role,

    /// Payload
    pub content: Content,
}

impl Turn {
    /// Create a turn
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
        }
    }

    /// User turn
    pub fn user(content: impl Into<Content>) -> Self {
        Self::new(Role::User, content)
    }

    /// Assistant turn
    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Tool result turn
    pub fn tool(content: impl Into<Content>) -> Self {
        Self::new(Role::Tool, content)
    }

    /// System turn
    pub fn system(content: impl Into<Content>) -> Self {
        Self::new(Role::System, content)
    }

    /// Attach an externally supplied id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A web page or document surfaced by a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Node key
    pub url: String,
    /// Page title
    pub title: String,
    /// Normalized, truncated text
    pub content: String,
}

/// A sanitized turn, ready to be written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Node key
    pub id: String,
    /// Position within the batch, counting only kept turns
    pub index: usize,
    /// Author
    pub role: Role,
    /// Conversational text; `None` for tool results
    pub content: Option<String>,
    /// Sources extracted from a tool result; `None` for other roles
    pub sources: Option<Vec<SourceDocument>>,
}

/// Node kinds of the conversation graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeLabel {
    /// Participant, keyed by email
    User,
    /// Conversation, keyed by session id
    Thread,
    /// User or assistant message
    Message,
    /// Tool result
    ToolCall,
    /// External document, keyed by URL
    Source,
    /// Slice of a Source
    Chunk,
}

impl NodeLabel {
    /// Every label
    pub const ALL: [NodeLabel; 6] = [
        NodeLabel::User,
        NodeLabel::Thread,
        NodeLabel::Message,
        NodeLabel::ToolCall,
        NodeLabel::Source,
        NodeLabel::Chunk,
    ];

    /// Label for a store label name
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|label| label.as_str() == name)
    }

    /// Label name in the store
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLabel::User => "User",
            NodeLabel::Thread => "Thread",
            NodeLabel::Message => "Message",
            NodeLabel::ToolCall => "ToolCall",
            NodeLabel::Source => "Source",
            NodeLabel::Chunk => "Chunk",
        }
    }

    /// Property carrying the unique key
    pub fn key_property(&self) -> &'static str {
        match self {
            NodeLabel::User => "email",
            NodeLabel::Source => "url",
            _ => "id",
        }
    }

    /// Property holding the embeddable text
    pub fn text_property(&self) -> &'static str {
        match self {
            NodeLabel::Source => "text",
            _ => "content",
        }
    }
}

impl fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edge types of the conversation graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relation {
    /// User -> Thread
    ParticipatedIn,
    /// Thread -> first Message, Source -> first Chunk
    First,
    /// Message -> Message, Chunk -> Chunk
    Next,
    /// Reply Message -> ToolCall it followed
    Triggered,
    /// ToolCall -> Source it surfaced
    Retrieved,
    /// Message -> Chunk | Source | Message used as context
    Sourced,
}

impl Relation {
    /// Relationship type in the store
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::ParticipatedIn => "PARTICIPATED_IN",
            Relation::First => "FIRST",
            Relation::Next => "NEXT",
            Relation::Triggered => "TRIGGERED",
            Relation::Retrieved => "RETRIEVED",
            Relation::Sourced => "SOURCED",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a node: label plus unique key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    /// Node kind
    pub label: NodeLabel,
    /// Value of the label's key property
    pub key: String,
}

impl NodeRef {
    /// Create a node reference
    pub fn new(label: NodeLabel, key: impl Into<String>) -> Self {
        Self {
            label,
            key: key.into(),
        }
    }

    /// User node
    pub fn user(email: impl Into<String>) -> Self {
        Self::new(NodeLabel::User, email)
    }

    /// Thread node
    pub fn thread(id: impl Into<String>) -> Self {
        Self::new(NodeLabel::Thread, id)
    }

    /// Message node
    pub fn message(id: impl Into<String>) -> Self {
        Self::new(NodeLabel::Message, id)
    }

    /// ToolCall node
    pub fn tool_call(id: impl Into<String>) -> Self {
        Self::new(NodeLabel::ToolCall, id)
    }

    /// Source node
    pub fn source(url: impl Into<String>) -> Self {
        Self::new(NodeLabel::Source, url)
    }

    /// Chunk node
    pub fn chunk(id: impl Into<String>) -> Self {
        Self::new(NodeLabel::Chunk, id)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}:{})", self.label, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_from_json_variants() {
        assert_eq!(Content::from(json!("hi")), Content::Text("hi".to_string()));
        assert_eq!(Content::from(json!(42)), Content::Text("42".to_string()));
        assert_eq!(Content::from(Value::Null), Content::empty());

        match Content::from(json!(["a", {"text": "b"}, 3])) {
            Content::Blocks(blocks) => assert_eq!(blocks.len(), 2),
            other => panic!("expected blocks, got {:?}", other),
        }

        assert!(matches!(Content::from(json!({"text": "x"})), Content::Raw(_)));
    }

    #[test]
    fn test_turn_deserializes_from_wire_shape() {
        let turn: Turn = serde_json::from_value(json!({
            "id": "m-1",
            "role": "assistant",
            "content": [{"type": "text", "text": "Hello"}]
        }))
        .unwrap();

        assert_eq!(turn.id.as_deref(), Some("m-1"));
        assert_eq!(turn.role, Role::Assistant);
        assert!(matches!(turn.content, Content::Blocks(_)));
    }

    #[test]
    fn test_label_keys() {
        assert_eq!(NodeLabel::User.key_property(), "email");
        assert_eq!(NodeLabel::Source.key_property(), "url");
        assert_eq!(NodeLabel::Chunk.key_property(), "id");
        assert_eq!(NodeLabel::Source.text_property(), "text");
        assert_eq!(NodeLabel::parse("ToolCall"), Some(NodeLabel::ToolCall));
        assert_eq!(NodeLabel::parse("toolcall"), None);
        assert_eq!(Relation::ParticipatedIn.to_string(), "PARTICIPATED_IN");
        assert_eq!(NodeRef::message("abc").to_string(), "(Message:abc)");
    }
}
