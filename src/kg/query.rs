//! Read-only, parameterized Cypher queries against the knowledge graph.
//!
//! Schema: nodes carry `:KGNode` plus one of `:SymbolNode | :FileNode |
//! :TextNode`; common properties are `repo_id`, `node_id`, `commit_sha`,
//! `relative_path`. Every query scopes by `repo_id` on both ends of a
//! pattern, and every value is bound as a parameter — relationship-type
//! sets are bound as array parameters so the engine can cache plans.

use neo4rs::{query, BoltList, BoltMap, BoltType, ConfigBuilder, Graph};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::config::{KgConfig, TimeoutsConfig};
use crate::error::{ReviewError, Result};

/// Properties of a KG node, as returned by `properties(n)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KgNodeProps {
    pub node_id: String,
    pub repo_id: String,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub relative_path: Option<String>,
    // SymbolNode fields
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub qualified_name: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub start_line: Option<i64>,
    #[serde(default)]
    pub end_line: Option<i64>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub docstring: Option<String>,
    // TextNode fields
    #[serde(default)]
    pub text: Option<String>,
    // FileNode fields
    #[serde(default)]
    pub basename: Option<String>,
}

/// A 1-hop neighbor row: relationship type, target labels, target node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborRow {
    pub rel_type: String,
    pub labels: Vec<String>,
    pub node: KgNodeProps,
}

/// Relationship types the retriever traverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelType {
    Calls,
    ContainsSymbol,
}

impl RelType {
    fn as_str(self) -> &'static str {
        match self {
            RelType::Calls => "CALLS",
            RelType::ContainsSymbol => "CONTAINS_SYMBOL",
        }
    }
}

/// Traversal direction, validated by construction — never string-spliced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// One symbol lookup request, also usable in the batched variant.
#[derive(Debug, Clone)]
pub struct FindSymbolRequest {
    pub file_path: String,
    pub name: String,
    pub qualified_name: Option<String>,
    pub kind: Option<String>,
    pub fingerprint: Option<String>,
}

/// Read-only query service over a process-wide bolt connection pool.
pub struct KgQueryService {
    graph: Graph,
    query_timeout: Duration,
}

impl KgQueryService {
    /// Connect to the graph using the configured pool settings.
    pub async fn connect(kg: &KgConfig, timeouts: &TimeoutsConfig) -> Result<Self> {
        let config = ConfigBuilder::default()
            .uri(&kg.uri)
            .user(&kg.user)
            .password(kg.resolve_password().unwrap_or_default())
            .db(kg.database.as_str())
            .max_connections(kg.pool_size)
            .build()
            .map_err(|e| ReviewError::KgUnavailable { message: e.to_string() })?;

        let connect = Graph::connect(config);
        let graph = tokio::time::timeout(timeouts.kg_connection(), connect)
            .await
            .map_err(|_| ReviewError::KgQueryTimeout { query: "connect".to_string() })?
            .map_err(|e| ReviewError::KgUnavailable { message: e.to_string() })?;

        Ok(Self { graph, query_timeout: timeouts.kg_query() })
    }

    /// Best-effort commit SHA the KG was built from; `None` when absent.
    ///
    /// Expected to differ from the PR head SHA — that difference is the
    /// drift signal, not an error.
    pub async fn get_repo_commit_sha(&self, repo_id: Uuid) -> Result<Option<String>> {
        let q = query(
            "MATCH (n:KGNode {repo_id: $repo_id}) \
             WHERE n.commit_sha IS NOT NULL \
             RETURN n.commit_sha AS commit_sha \
             LIMIT 1",
        )
        .param("repo_id", repo_id.to_string());

        let mut rows = self.run("get_repo_commit_sha", q).await?;
        match self.next_row("get_repo_commit_sha", &mut rows).await? {
            Some(row) => Ok(row.get("commit_sha").ok()),
            None => Ok(None),
        }
    }

    /// Find SymbolNode candidates for a seed symbol.
    ///
    /// Always scoped by `(repo_id, relative_path)`; prefers qualified name
    /// over bare name, optionally narrowed by kind and fingerprint.
    pub async fn find_symbol(
        &self,
        repo_id: Uuid,
        request: &FindSymbolRequest,
        limit: usize,
    ) -> Result<Vec<KgNodeProps>> {
        if request.file_path.is_empty()
            || (request.name.is_empty() && request.qualified_name.is_none())
        {
            return Ok(Vec::new());
        }

        let mut conditions = vec!["s.repo_id = $repo_id", "s.relative_path = $file_path"];
        if request.qualified_name.is_some() {
            conditions.push("s.qualified_name = $qualified_name");
        } else {
            conditions.push("s.name = $name");
        }
        if request.kind.is_some() {
            conditions.push("s.kind = $kind");
        }
        if request.fingerprint.is_some() {
            conditions.push("s.fingerprint = $fingerprint");
        }

        let text = format!(
            "MATCH (s:KGNode:SymbolNode) WHERE {} RETURN properties(s) AS node LIMIT $limit",
            conditions.join(" AND ")
        );

        let mut q = query(&text)
            .param("repo_id", repo_id.to_string())
            .param("file_path", request.file_path.as_str())
            .param("limit", limit.max(1) as i64);
        if let Some(qn) = &request.qualified_name {
            q = q.param("qualified_name", qn.as_str());
        } else {
            q = q.param("name", request.name.as_str());
        }
        if let Some(kind) = &request.kind {
            q = q.param("kind", kind.as_str());
        }
        if let Some(fp) = &request.fingerprint {
            q = q.param("fingerprint", fp.as_str());
        }

        let mut rows = self.run("find_symbol", q).await?;
        let mut out = Vec::new();
        while let Some(row) = self.next_row("find_symbol", &mut rows).await? {
            if let Ok(node) = row.get::<KgNodeProps>("node") {
                out.push(node);
            }
        }
        Ok(out)
    }

    /// Batched symbol lookup: one UNWIND round trip for N requests.
    ///
    /// Rows come back tagged by request index. Absent optional fields are
    /// omitted from the request maps so the Cypher `IS NULL` guards apply.
    pub async fn find_symbols_batch(
        &self,
        repo_id: Uuid,
        requests: &[FindSymbolRequest],
        limit_per_symbol: usize,
    ) -> Result<Vec<(usize, KgNodeProps)>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut list = BoltList::default();
        for (index, request) in requests.iter().enumerate() {
            let mut map = BoltMap::default();
            map.put("index".into(), (index as i64).into());
            map.put("file_path".into(), request.file_path.as_str().into());
            map.put("name".into(), request.name.as_str().into());
            if let Some(qn) = &request.qualified_name {
                map.put("qualified_name".into(), qn.as_str().into());
            }
            if let Some(kind) = &request.kind {
                map.put("kind".into(), kind.as_str().into());
            }
            if let Some(fp) = &request.fingerprint {
                map.put("fingerprint".into(), fp.as_str().into());
            }
            list.push(BoltType::Map(map));
        }

        let q = query(
            "UNWIND $symbol_requests AS req \
             MATCH (s:KGNode:SymbolNode) \
             WHERE s.repo_id = $repo_id \
               AND s.relative_path = req.file_path \
               AND ( \
                 (req.qualified_name IS NOT NULL AND s.qualified_name = req.qualified_name) \
                 OR (req.qualified_name IS NULL AND s.name = req.name) \
               ) \
               AND (req.kind IS NULL OR s.kind = req.kind) \
               AND (req.fingerprint IS NULL OR s.fingerprint = req.fingerprint) \
             WITH req, s \
             ORDER BY req.index, s.node_id \
             WITH req, COLLECT(s)[0..$limit_per_symbol] AS matches \
             UNWIND matches AS m \
             RETURN req.index AS request_index, properties(m) AS node \
             ORDER BY req.index",
        )
        .param("repo_id", repo_id.to_string())
        .param("symbol_requests", BoltType::List(list))
        .param("limit_per_symbol", limit_per_symbol.max(1) as i64);

        let mut rows = self.run("find_symbols_batch", q).await?;
        let mut out = Vec::new();
        while let Some(row) = self.next_row("find_symbols_batch", &mut rows).await? {
            let index: i64 = row
                .get("request_index")
                .map_err(|e| ReviewError::KgUnavailable { message: e.to_string() })?;
            if let Ok(node) = row.get::<KgNodeProps>("node") {
                out.push((index as usize, node));
            }
        }
        Ok(out)
    }

    /// Expand 1-hop neighbors of a symbol node.
    pub async fn expand_symbol_neighbors(
        &self,
        repo_id: Uuid,
        symbol_node_id: &str,
        rel_types: &[RelType],
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<NeighborRow>> {
        if rel_types.is_empty() {
            return Ok(Vec::new());
        }

        let pattern = match direction {
            Direction::Outgoing => "(s)-[r]->(n)",
            Direction::Incoming => "(s)<-[r]-(n)",
        };
        let text = format!(
            "MATCH (s:KGNode:SymbolNode {{repo_id: $repo_id, node_id: $symbol_node_id}}) \
             MATCH {pattern} \
             WHERE n.repo_id = $repo_id AND type(r) IN $rel_types \
             RETURN type(r) AS rel_type, labels(n) AS labels, properties(n) AS node \
             LIMIT $limit"
        );

        let mut rels = BoltList::default();
        for rel in rel_types {
            rels.push(rel.as_str().into());
        }

        let q = query(&text)
            .param("repo_id", repo_id.to_string())
            .param("symbol_node_id", symbol_node_id)
            .param("rel_types", BoltType::List(rels))
            .param("limit", limit.max(1) as i64);

        self.collect_neighbor_rows("expand_symbol_neighbors", q).await
    }

    /// Import neighborhood of a file node.
    pub async fn get_import_neighborhood(
        &self,
        repo_id: Uuid,
        file_path: &str,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<NeighborRow>> {
        let pattern = match direction {
            Direction::Outgoing => "(f)-[r:IMPORTS]->(n)",
            Direction::Incoming => "(f)<-[r:IMPORTS]-(n)",
        };
        let text = format!(
            "MATCH (f:KGNode:FileNode {{repo_id: $repo_id, relative_path: $file_path}}) \
             MATCH {pattern} \
             WHERE n.repo_id = $repo_id \
             RETURN type(r) AS rel_type, labels(n) AS labels, properties(n) AS node \
             LIMIT $limit"
        );

        let q = query(&text)
            .param("repo_id", repo_id.to_string())
            .param("file_path", file_path)
            .param("limit", limit.max(1) as i64);

        self.collect_neighbor_rows("get_import_neighborhood", q).await
    }

    /// Documentation text nodes under a path prefix.
    pub async fn get_text_nodes(
        &self,
        repo_id: Uuid,
        path_prefix: &str,
        limit: usize,
    ) -> Result<Vec<KgNodeProps>> {
        if path_prefix.is_empty() {
            return Ok(Vec::new());
        }

        let q = query(
            "MATCH (t:KGNode:TextNode {repo_id: $repo_id}) \
             WHERE t.relative_path STARTS WITH $path_prefix \
             RETURN properties(t) AS node \
             ORDER BY t.relative_path, t.start_line \
             LIMIT $limit",
        )
        .param("repo_id", repo_id.to_string())
        .param("path_prefix", path_prefix)
        .param("limit", limit.max(1) as i64);

        let mut rows = self.run("get_text_nodes", q).await?;
        let mut out = Vec::new();
        while let Some(row) = self.next_row("get_text_nodes", &mut rows).await? {
            if let Ok(node) = row.get::<KgNodeProps>("node") {
                out.push(node);
            }
        }
        Ok(out)
    }

    async fn collect_neighbor_rows(
        &self,
        name: &str,
        q: neo4rs::Query,
    ) -> Result<Vec<NeighborRow>> {
        let mut rows = self.run(name, q).await?;
        let mut out = Vec::new();
        while let Some(row) = self.next_row(name, &mut rows).await? {
            let rel_type: String = row
                .get("rel_type")
                .map_err(|e| ReviewError::KgUnavailable { message: e.to_string() })?;
            let labels: Vec<String> = row.get("labels").unwrap_or_default();
            if let Ok(node) = row.get::<KgNodeProps>("node") {
                out.push(NeighborRow { rel_type, labels, node });
            }
        }
        Ok(out)
    }

    // neo4rs 0.8 does not export `DetachedRowStream` from its crate root (the
    // `stream` module is private), so the type cannot be named here. Convert
    // immediately to a boxed `Stream` via the public `into_stream` method instead.
    async fn run(
        &self,
        name: &str,
        q: neo4rs::Query,
    ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = std::result::Result<neo4rs::Row, neo4rs::Error>> + Send>>>
    {
        debug!("kg query: {name}");
        let stream = tokio::time::timeout(self.query_timeout, self.graph.execute(q))
            .await
            .map_err(|_| ReviewError::KgQueryTimeout { query: name.to_string() })?
            .map_err(|e| ReviewError::KgUnavailable { message: format!("{name}: {e}") })?;
        Ok(Box::pin(futures::TryStreamExt::into_stream(stream.into_stream())))
    }

    async fn next_row(
        &self,
        name: &str,
        rows: &mut std::pin::Pin<Box<dyn futures::Stream<Item = std::result::Result<neo4rs::Row, neo4rs::Error>> + Send>>,
    ) -> Result<Option<neo4rs::Row>> {
        use futures::StreamExt;
        tokio::time::timeout(self.query_timeout, rows.next())
            .await
            .map_err(|_| ReviewError::KgQueryTimeout { query: name.to_string() })?
            .transpose()
            .map_err(|e| ReviewError::KgUnavailable { message: format!("{name}: {e}") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rel_type_strings() {
        assert_eq!(RelType::Calls.as_str(), "CALLS");
        assert_eq!(RelType::ContainsSymbol.as_str(), "CONTAINS_SYMBOL");
    }

    #[test]
    fn test_node_props_deserialize_partial() {
        // TextNode rows carry no symbol fields
        let json = serde_json::json!({
            "node_id": "n-1",
            "repo_id": "r-1",
            "relative_path": "README.md",
            "text": "# Title",
            "start_line": 1,
            "end_line": 12
        });
        let props: KgNodeProps = serde_json::from_value(json).unwrap();
        assert_eq!(props.node_id, "n-1");
        assert_eq!(props.text.as_deref(), Some("# Title"));
        assert!(props.name.is_none());
        assert!(props.fingerprint.is_none());
    }
}
