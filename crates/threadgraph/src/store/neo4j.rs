//! Neo4j graph store over the Bolt protocol
//!
//! Every primitive is one Cypher statement. Labels, relationship types and
//! property names come from the crate's own vocabulary and are formatted into
//! the query text; all values travel as parameters.

use super::{
    GraphStore, GraphTransaction, NodeRecord, PendingContent, Properties, PropertyValue,
    ScoredNode,
};
use crate::config::Neo4jConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::model::{NodeLabel, NodeRef, Relation};
use crate::schema::{SchemaStatement, EMBEDDING_PROPERTY};
use chrono::{DateTime, FixedOffset, Utc};
use neo4rs::{query, ConfigBuilder, Graph, Node, Query, Row, Txn};
use tracing::{debug, info};

/// Neo4j-backed [`GraphStore`]
#[derive(Clone)]
pub struct Neo4jGraphStore {
    graph: Graph,
    database: String,
}

impl Neo4jGraphStore {
    /// Connect and verify the connection with a trivial query
    pub async fn connect(settings: &Neo4jConfig) -> MemoryResult<Self> {
        let config = ConfigBuilder::default()
            .uri(settings.uri.as_str())
            .user(settings.username.as_str())
            .password(settings.password.as_str())
            .db(settings.database.as_str())
            .build()
            .map_err(|e| MemoryError::configuration(e.to_string()))?;

        let graph = Graph::connect(config)
            .await
            .map_err(|e| store_error("connect", e))?;

        let store = Self {
            graph,
            database: settings.database.clone(),
        };
        store.fetch("connect", query("RETURN 1 AS ok")).await?;
        info!(uri = %settings.uri, database = %store.database, "connected to Neo4j");
        Ok(store)
    }

    async fn fetch(&self, operation: &str, q: Query) -> MemoryResult<Vec<Row>> {
        let mut stream = self
            .graph
            .execute(q)
            .await
            .map_err(|e| store_error(operation, e))?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await.map_err(|e| store_error(operation, e))? {
            rows.push(row);
        }
        Ok(rows)
    }

    async fn pending(&self, operation: &str, q: Query) -> MemoryResult<Vec<PendingContent>> {
        let label_rows = self.fetch(operation, q).await?;
        let mut pending = Vec::with_capacity(label_rows.len());
        for row in label_rows {
            let label = row_string(&row, "label")?;
            let label = NodeLabel::parse(&label)
                .ok_or_else(|| MemoryError::store(operation, format!("unknown label {}", label)))?;
            pending.push(PendingContent {
                node: NodeRef::new(label, row_string(&row, "key")?),
                text: row_string(&row, "text")?,
            });
        }
        Ok(pending)
    }
}

#[async_trait::async_trait]
impl GraphStore for Neo4jGraphStore {
    fn backend_name(&self) -> &str {
        "neo4j"
    }

    async fn run_schema(&self, statement: &SchemaStatement) -> MemoryResult<()> {
        self.graph
            .run(query(&statement.to_cypher()))
            .await
            .map_err(|e| MemoryError::Schema {
                name: statement.name().to_string(),
                message: e.to_string(),
            })
    }

    async fn begin(&self) -> MemoryResult<Box<dyn GraphTransaction>> {
        let txn = self
            .graph
            .start_txn()
            .await
            .map_err(|e| store_error("begin", e))?;
        Ok(Box::new(Neo4jTransaction { txn }))
    }

    async fn find_node(&self, node: &NodeRef) -> MemoryResult<Option<NodeRecord>> {
        let rows = self.fetch("find_node", find_node_query(node)).await?;
        rows.first().map(|row| row_node(row, "n")).transpose()
    }

    async fn outgoing(&self, node: &NodeRef, relation: Relation) -> MemoryResult<Vec<NodeRecord>> {
        let rows = self.fetch("outgoing", outgoing_query(node, relation)).await?;
        sorted_nodes(&rows, "m")
    }

    async fn pending_embeddings(&self, label: NodeLabel) -> MemoryResult<Vec<PendingContent>> {
        let cypher = format!(
            "MATCH (n:{label}) WHERE n.{text} IS NOT NULL AND n.{embedding} IS NULL \
             RETURN '{label}' AS label, n.{key} AS key, n.{text} AS text ORDER BY key",
            label = label,
            text = label.text_property(),
            embedding = EMBEDDING_PROPERTY,
            key = label.key_property(),
        );
        self.pending("pending_embeddings", query(&cypher)).await
    }

    async fn unchunked_sources(&self) -> MemoryResult<Vec<PendingContent>> {
        let cypher = format!(
            "MATCH (s:Source) WHERE s.text IS NOT NULL AND NOT (s)-[:{first}]->() \
             RETURN 'Source' AS label, s.url AS key, s.text AS text ORDER BY key",
            first = Relation::First,
        );
        self.pending("unchunked_sources", query(&cypher)).await
    }

    async fn vector_search(
        &self,
        index: &str,
        vector: &[f32],
        limit: usize,
    ) -> MemoryResult<Vec<ScoredNode>> {
        let q = query(
            "CALL db.index.vector.queryNodes($index, $limit, $vector) \
             YIELD node, score RETURN node, score ORDER BY score DESC",
        )
        .param("index", index)
        .param("limit", limit as i64)
        .param("vector", embedding_to_f64(vector));

        let rows = self.fetch("vector_search", q).await.map_err(|e| {
            MemoryError::Retrieval(format!("vector index '{}': {}", index, e))
        })?;

        rows.iter()
            .map(|row| {
                let score: f64 = row
                    .get("score")
                    .map_err(|e| MemoryError::store("vector_search", e))?;
                Ok(ScoredNode {
                    node: row_node(row, "node")?,
                    score: score as f32,
                })
            })
            .collect()
    }

    async fn close(&self) -> MemoryResult<()> {
        debug!(database = %self.database, "releasing Neo4j connection pool");
        Ok(())
    }
}

struct Neo4jTransaction {
    txn: Txn,
}

impl Neo4jTransaction {
    async fn fetch(&mut self, operation: &str, q: Query) -> MemoryResult<Vec<Row>> {
        let mut stream = self
            .txn
            .execute(q)
            .await
            .map_err(|e| store_error(operation, e))?;
        let mut rows = Vec::new();
        while let Some(row) = stream
            .next(self.txn.handle())
            .await
            .map_err(|e| store_error(operation, e))?
        {
            rows.push(row);
        }
        Ok(rows)
    }
}

#[async_trait::async_trait]
impl GraphTransaction for Neo4jTransaction {
    async fn merge_node(&mut self, node: &NodeRef, on_create: Properties) -> MemoryResult<bool> {
        let mut assignments = Vec::with_capacity(on_create.len());
        for name in on_create.keys() {
            check_property_name(name)?;
            assignments.push(format!("n.{name} = $p_{name}", name = name));
        }
        let on_create_clause = if assignments.is_empty() {
            String::new()
        } else {
            format!(" ON CREATE SET {}", assignments.join(", "))
        };

        let cypher = format!(
            "OPTIONAL MATCH {existing} WITH existing IS NULL AS created \
             MERGE {node}{on_create} RETURN created",
            existing = node_pattern("existing", node, "key"),
            node = node_pattern("n", node, "key"),
            on_create = on_create_clause,
        );
        let mut q = query(&cypher).param("key", node.key.as_str());
        for (name, value) in on_create {
            q = bind(q, &format!("p_{}", name), value);
        }

        let rows = self.fetch("merge_node", q).await?;
        match rows.first() {
            Some(row) => row
                .get::<bool>("created")
                .map_err(|e| MemoryError::store("merge_node", e)),
            None => Err(MemoryError::store("merge_node", format!("no result for {}", node))),
        }
    }

    async fn merge_edge(
        &mut self,
        from: &NodeRef,
        relation: Relation,
        to: &NodeRef,
    ) -> MemoryResult<()> {
        let cypher = format!(
            "MATCH {a} MATCH {b} MERGE (a)-[:{relation}]->(b) RETURN count(*) AS linked",
            a = node_pattern("a", from, "from"),
            b = node_pattern("b", to, "to"),
            relation = relation,
        );
        let q = query(&cypher)
            .param("from", from.key.as_str())
            .param("to", to.key.as_str());

        let linked = self
            .fetch("merge_edge", q)
            .await?
            .first()
            .and_then(|row| row.get::<i64>("linked").ok())
            .unwrap_or(0);
        if linked == 0 {
            return Err(MemoryError::store(
                "merge_edge",
                format!("missing endpoint for {} -[{}]-> {}", from, relation, to),
            ));
        }
        Ok(())
    }

    async fn set_missing(&mut self, node: &NodeRef, properties: Properties) -> MemoryResult<usize> {
        let mut written = 0;
        for (name, value) in properties {
            check_property_name(&name)?;
            let cypher = format!(
                "MATCH {node} WHERE n.{name} IS NULL SET n.{name} = $value RETURN count(n) AS written",
                node = node_pattern("n", node, "key"),
                name = name,
            );
            let q = bind(query(&cypher).param("key", node.key.as_str()), "value", value);
            written += self
                .fetch("set_missing", q)
                .await?
                .first()
                .and_then(|row| row.get::<i64>("written").ok())
                .unwrap_or(0) as usize;
        }
        Ok(written)
    }

    async fn lock_node(&mut self, node: &NodeRef) -> MemoryResult<()> {
        let cypher = format!(
            "MATCH {} SET n._lock = true REMOVE n._lock",
            node_pattern("n", node, "key")
        );
        self.fetch("lock_node", query(&cypher).param("key", node.key.as_str()))
            .await?;
        Ok(())
    }

    async fn find_node(&mut self, node: &NodeRef) -> MemoryResult<Option<NodeRecord>> {
        let rows = self.fetch("find_node", find_node_query(node)).await?;
        rows.first().map(|row| row_node(row, "n")).transpose()
    }

    async fn outgoing(
        &mut self,
        node: &NodeRef,
        relation: Relation,
    ) -> MemoryResult<Vec<NodeRecord>> {
        let rows = self.fetch("outgoing", outgoing_query(node, relation)).await?;
        sorted_nodes(&rows, "m")
    }

    async fn commit(self: Box<Self>) -> MemoryResult<()> {
        self.txn.commit().await.map_err(|e| store_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> MemoryResult<()> {
        self.txn.rollback().await.map_err(|e| store_error("rollback", e))
    }
}

/// `(var:Label {key_property: $param})`
fn node_pattern(var: &str, node: &NodeRef, param: &str) -> String {
    format!(
        "({}:{} {{{}: ${}}})",
        var,
        node.label,
        node.label.key_property(),
        param
    )
}

fn find_node_query(node: &NodeRef) -> Query {
    let cypher = format!("MATCH {} RETURN n", node_pattern("n", node, "key"));
    query(&cypher).param("key", node.key.as_str())
}

fn outgoing_query(node: &NodeRef, relation: Relation) -> Query {
    let cypher = format!(
        "MATCH {}-[:{}]->(m) RETURN DISTINCT m",
        node_pattern("n", node, "key"),
        relation
    );
    query(&cypher).param("key", node.key.as_str())
}

fn sorted_nodes(rows: &[Row], column: &str) -> MemoryResult<Vec<NodeRecord>> {
    let mut records = rows
        .iter()
        .map(|row| row_node(row, column))
        .collect::<MemoryResult<Vec<_>>>()?;
    records.sort_by(|a, b| (a.label().as_str(), a.key()).cmp(&(b.label().as_str(), b.key())));
    Ok(records)
}

fn row_string(row: &Row, column: &str) -> MemoryResult<String> {
    row.get::<String>(column)
        .map_err(|e| MemoryError::store("decode", format!("column '{}': {}", column, e)))
}

/// Decode a returned node into a record, keeping the property types we write
fn row_node(row: &Row, column: &str) -> MemoryResult<NodeRecord> {
    let node: Node = row
        .get(column)
        .map_err(|e| MemoryError::store("decode", format!("column '{}': {}", column, e)))?;

    let label = node
        .labels()
        .into_iter()
        .find_map(NodeLabel::parse)
        .ok_or_else(|| MemoryError::store("decode", "node carries no known label"))?;
    let key_property = label.key_property();
    let key: String = node
        .get(key_property)
        .map_err(|e| MemoryError::store("decode", format!("node key: {}", e)))?;

    let mut properties = Properties::new();
    for name in node.keys() {
        if name == key_property {
            continue;
        }
        if let Some(value) = decode_property(&node, name) {
            properties.insert(name.to_string(), value);
        }
    }

    Ok(NodeRecord::new(NodeRef::new(label, key), properties))
}

fn decode_property(node: &Node, name: &str) -> Option<PropertyValue> {
    if let Ok(text) = node.get::<String>(name) {
        return Some(PropertyValue::Text(text));
    }
    if let Ok(value) = node.get::<i64>(name) {
        return Some(PropertyValue::Integer(value));
    }
    if let Ok(value) = node.get::<f64>(name) {
        return Some(PropertyValue::Float(value));
    }
    if let Ok(vector) = node.get::<Vec<f64>>(name) {
        return Some(PropertyValue::Vector(vector.into_iter().map(|x| x as f32).collect()));
    }
    if let Ok(at) = node.get::<DateTime<FixedOffset>>(name) {
        return Some(PropertyValue::Timestamp(at.with_timezone(&Utc)));
    }
    None
}

fn bind(q: Query, name: &str, value: PropertyValue) -> Query {
    match value {
        PropertyValue::Text(text) => q.param(name, text),
        PropertyValue::Integer(value) => q.param(name, value),
        PropertyValue::Float(value) => q.param(name, value),
        PropertyValue::Vector(vector) => q.param(name, embedding_to_f64(&vector)),
        PropertyValue::Timestamp(at) => q.param(name, at.fixed_offset()),
    }
}

fn embedding_to_f64(embedding: &[f32]) -> Vec<f64> {
    embedding.iter().map(|&x| x as f64).collect()
}

fn check_property_name(name: &str) -> MemoryResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MemoryError::validation(
            "property",
            "must be ASCII alphanumeric or underscore",
            name,
        ))
    }
}

/// Map a driver error, flagging the ones worth retrying
fn store_error(operation: &str, error: neo4rs::Error) -> MemoryError {
    let message = error.to_string();
    let transient = [
        "TransientError",
        "DeadlockDetected",
        "LockClient",
        "LeaderSwitch",
        "NotALeader",
        "ConnectionError",
        "connection",
    ]
    .iter()
    .any(|marker| message.contains(marker));

    if transient {
        MemoryError::transient(operation, message)
    } else {
        MemoryError::store(operation, message)
    }
}
