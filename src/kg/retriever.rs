//! Bounded KG candidate retrieval.
//!
//! Turns the seed set into a deduplicated candidate set: symbol matches,
//! call/containment neighbors, import neighborhood, and documentation.
//! Per-seed fan-out runs concurrently under a semaphore-equivalent bound
//! (ordered buffering), and the final ordering is imposed after merge so
//! concurrency never changes the output. Any query failure degrades
//! gracefully: whatever was gathered survives, with a warning.

use futures::stream::{self, StreamExt};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{LimitsConfig, ParallelismConfig};
use crate::error::ReviewError;
use crate::seed::{SeedSet, SeedSymbol};
use crate::types::{CandidateType, Relationship};

use super::query::{Direction, FindSymbolRequest, KgNodeProps, KgQueryService, RelType};

/// Seeds above this count switch `find_symbol` to the batched UNWIND form.
const BATCH_FIND_THRESHOLD: usize = 3;

/// Doc path prefixes searched, in order.
const DOC_PATH_PREFIXES: [&str; 4] = ["README", "docs/", "doc/", "documentation/"];

/// One candidate row in the flat list.
#[derive(Debug, Clone, Serialize)]
pub struct KgCandidate {
    pub candidate_type: CandidateType,
    pub node: KgNodeProps,
    /// Set for neighbor and import-neighbor candidates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<Relationship>,
    /// Matched symbol node that produced a neighbor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_symbol_id: Option<String>,
    /// Seed file that produced an import neighbor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    /// Prefix that matched a doc candidate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
}

/// Counters from one retrieval pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CandidateStats {
    pub seed_symbols_processed: usize,
    pub seed_files_processed: usize,
    pub kg_symbols_found: usize,
    pub kg_symbols_missing: usize,
    pub callers_retrieved: usize,
    pub callees_retrieved: usize,
    pub contains_retrieved: usize,
    pub import_neighbors_retrieved: usize,
    pub docs_retrieved: usize,
    pub total_candidates: usize,
    pub retrieval_duration_ms: u64,
}

/// Result of KG candidate retrieval.
///
/// Serialization exposes both the class-keyed buckets and a flat
/// `candidates` list; downstream stages consume the flat list.
#[derive(Debug, Clone, Default)]
pub struct KgCandidateResult {
    pub kg_commit_sha: Option<String>,
    pub symbol_matches: Vec<KgCandidate>,
    pub neighbors: Vec<KgCandidate>,
    pub import_neighbors: Vec<KgCandidate>,
    pub docs: Vec<KgCandidate>,
    pub stats: CandidateStats,
    pub warnings: Vec<String>,
}

impl KgCandidateResult {
    /// All candidates in bucket order; every entry carries `candidate_type`.
    pub fn flat_candidates(&self) -> Vec<&KgCandidate> {
        self.symbol_matches
            .iter()
            .chain(self.neighbors.iter())
            .chain(self.import_neighbors.iter())
            .chain(self.docs.iter())
            .collect()
    }

    fn total(&self) -> usize {
        self.symbol_matches.len()
            + self.neighbors.len()
            + self.import_neighbors.len()
            + self.docs.len()
    }
}

impl Serialize for KgCandidateResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("KgCandidateResult", 8)?;
        s.serialize_field("kg_commit_sha", &self.kg_commit_sha)?;
        s.serialize_field("symbol_matches", &self.symbol_matches)?;
        s.serialize_field("neighbors", &self.neighbors)?;
        s.serialize_field("import_neighbors", &self.import_neighbors)?;
        s.serialize_field("docs", &self.docs)?;
        s.serialize_field("candidates", &self.flat_candidates())?;
        s.serialize_field("stats", &self.stats)?;
        s.serialize_field("warnings", &self.warnings)?;
        s.end()
    }
}

/// Retrieves bounded context candidates from the KG for one run.
pub struct CandidateRetriever<'a> {
    kg: &'a KgQueryService,
    limits: &'a LimitsConfig,
    parallelism: &'a ParallelismConfig,
}

impl<'a> CandidateRetriever<'a> {
    pub fn new(
        kg: &'a KgQueryService,
        limits: &'a LimitsConfig,
        parallelism: &'a ParallelismConfig,
    ) -> Self {
        Self { kg, limits, parallelism }
    }

    /// Retrieve all candidates for a seed set with strict bounding.
    pub async fn retrieve(&self, repo_id: Uuid, seeds: &SeedSet) -> KgCandidateResult {
        let start = Instant::now();
        let mut result = KgCandidateResult::default();

        if seeds.is_empty() {
            info!("no seeds for repo {repo_id}, skipping KG retrieval");
            return result;
        }

        let mut seen_node_ids: HashSet<String> = HashSet::new();

        if let Err(e) = self.run(repo_id, seeds, &mut result, &mut seen_node_ids).await {
            warn!("KG candidate retrieval degraded for repo {repo_id}: {e}");
            result.warnings.push(format!("kg_retrieval_error:{}", e.code()));
        }

        result.stats.total_candidates = result.total();
        result.stats.retrieval_duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "KG retrieval for repo {repo_id}: {} candidates in {}ms",
            result.stats.total_candidates, result.stats.retrieval_duration_ms
        );
        result
    }

    async fn run(
        &self,
        repo_id: Uuid,
        seeds: &SeedSet,
        result: &mut KgCandidateResult,
        seen: &mut HashSet<String>,
    ) -> crate::error::Result<()> {
        // 1. Drift signal
        result.kg_commit_sha = self.kg.get_repo_commit_sha(repo_id).await?;
        if result.kg_commit_sha.is_none() {
            result.warnings.push("kg_commit_sha_not_found".to_string());
            warn!("no commit SHA found in KG for repo {repo_id}");
        }

        // 2. Seed symbols -> symbol matches + neighbors
        self.process_seed_symbols(repo_id, &seeds.symbols, result, seen).await?;

        // 3. Unique files from both seed sources -> import neighborhood
        self.process_seed_files(repo_id, &seeds.unique_file_paths(), result, seen).await?;

        // 4. Documentation
        self.retrieve_docs(repo_id, result, seen).await?;

        Ok(())
    }

    async fn process_seed_symbols(
        &self,
        repo_id: Uuid,
        symbols: &[SeedSymbol],
        result: &mut KgCandidateResult,
        seen: &mut HashSet<String>,
    ) -> crate::error::Result<()> {
        if symbols.is_empty() {
            return Ok(());
        }
        result.stats.seed_symbols_processed = symbols.len();

        let requests: Vec<FindSymbolRequest> = symbols
            .iter()
            .map(|s| FindSymbolRequest {
                file_path: s.file_path.clone(),
                name: s.name.clone(),
                qualified_name: s.qualified_name.clone(),
                kind: Some(s.kind.to_string()),
                fingerprint: s.fingerprint.clone(),
            })
            .collect();

        // Matches per request index, ordered to keep the output deterministic
        let per_seed = self.find_matches(repo_id, &requests).await?;

        let mut matched: Vec<KgNodeProps> = Vec::new();
        for (seed_index, matches) in per_seed.iter().enumerate() {
            if matches.is_empty() {
                result.stats.kg_symbols_missing += 1;
                debug!(
                    "no KG match for seed symbol {}:{}",
                    symbols[seed_index].file_path, symbols[seed_index].name
                );
                continue;
            }
            for node in matches {
                if !seen.insert(node.node_id.clone()) {
                    continue;
                }
                result.stats.kg_symbols_found += 1;
                result.symbol_matches.push(KgCandidate {
                    candidate_type: CandidateType::SymbolMatch,
                    node: node.clone(),
                    relationship: None,
                    source_symbol_id: None,
                    source_file: None,
                    path_prefix: None,
                });
                matched.push(node.clone());
            }
        }

        // Expand neighbors for each matched symbol: callers, callees,
        // contains, each bounded independently. Fan out concurrently,
        // merge in match order.
        let expansions: Vec<_> = stream::iter(matched.iter().map(|node| {
            let node_id = node.node_id.clone();
            async move {
                let callers = self
                    .kg
                    .expand_symbol_neighbors(
                        repo_id,
                        &node_id,
                        &[RelType::Calls],
                        Direction::Incoming,
                        self.limits.max_callers_per_seed,
                    )
                    .await?;
                let callees = self
                    .kg
                    .expand_symbol_neighbors(
                        repo_id,
                        &node_id,
                        &[RelType::Calls],
                        Direction::Outgoing,
                        self.limits.max_callees_per_seed,
                    )
                    .await?;
                let contains = self
                    .kg
                    .expand_symbol_neighbors(
                        repo_id,
                        &node_id,
                        &[RelType::ContainsSymbol],
                        Direction::Outgoing,
                        self.limits.max_contains_per_seed,
                    )
                    .await?;
                Ok::<_, ReviewError>((node_id, callers, callees, contains))
            }
        }))
        .buffered(self.parallelism.max_parallel_kg_calls.max(1))
        .collect()
        .await;

        for expansion in expansions {
            let (source_id, callers, callees, contains) = expansion?;
            for (rows, relationship, counter) in [
                (callers, Relationship::Caller, &mut result.stats.callers_retrieved),
                (callees, Relationship::Callee, &mut result.stats.callees_retrieved),
                (contains, Relationship::Contains, &mut result.stats.contains_retrieved),
            ] {
                for row in rows {
                    if !seen.insert(row.node.node_id.clone()) {
                        continue;
                    }
                    *counter += 1;
                    result.neighbors.push(KgCandidate {
                        candidate_type: CandidateType::Neighbor,
                        node: row.node,
                        relationship: Some(relationship),
                        source_symbol_id: Some(source_id.clone()),
                        source_file: None,
                        path_prefix: None,
                    });
                }
            }
        }

        Ok(())
    }

    /// Symbol matches per request index, in request order.
    async fn find_matches(
        &self,
        repo_id: Uuid,
        requests: &[FindSymbolRequest],
    ) -> crate::error::Result<Vec<Vec<KgNodeProps>>> {
        let limit = self.limits.max_kg_symbol_matches_per_seed;

        if requests.len() > BATCH_FIND_THRESHOLD {
            let tagged = self.kg.find_symbols_batch(repo_id, requests, limit).await?;
            let mut per_seed = vec![Vec::new(); requests.len()];
            for (index, node) in tagged {
                if index < per_seed.len() {
                    per_seed[index].push(node);
                }
            }
            return Ok(per_seed);
        }

        let results: Vec<_> = stream::iter(requests.iter().map(|request| async move {
            self.kg.find_symbol(repo_id, request, limit).await
        }))
        .buffered(self.parallelism.max_parallel_kg_calls.max(1))
        .collect()
        .await;

        results.into_iter().collect()
    }

    async fn process_seed_files(
        &self,
        repo_id: Uuid,
        file_paths: &[String],
        result: &mut KgCandidateResult,
        seen: &mut HashSet<String>,
    ) -> crate::error::Result<()> {
        result.stats.seed_files_processed = file_paths.len();
        let full_cap = self.limits.max_import_files_per_seed_file;

        let neighborhoods: Vec<_> = stream::iter(file_paths.iter().map(|file_path| {
            let path = file_path.clone();
            async move {
                // Outgoing first at full cap, incoming at half cap to
                // prioritize what the changed file depends on.
                let outgoing = self
                    .kg
                    .get_import_neighborhood(repo_id, &path, Direction::Outgoing, full_cap)
                    .await?;
                let incoming = self
                    .kg
                    .get_import_neighborhood(
                        repo_id,
                        &path,
                        Direction::Incoming,
                        (full_cap / 2).max(1),
                    )
                    .await?;
                Ok::<_, ReviewError>((path, outgoing, incoming))
            }
        }))
        .buffered(self.parallelism.max_parallel_kg_calls.max(1))
        .collect()
        .await;

        for neighborhood in neighborhoods {
            let (path, outgoing, incoming) = neighborhood?;
            for (rows, relationship) in [
                (outgoing, Relationship::Imports),
                (incoming, Relationship::ImportedBy),
            ] {
                for row in rows {
                    if !seen.insert(row.node.node_id.clone()) {
                        continue;
                    }
                    result.stats.import_neighbors_retrieved += 1;
                    result.import_neighbors.push(KgCandidate {
                        candidate_type: CandidateType::ImportNeighbor,
                        node: row.node,
                        relationship: Some(relationship),
                        source_symbol_id: None,
                        source_file: Some(path.clone()),
                        path_prefix: None,
                    });
                }
            }
        }

        Ok(())
    }

    async fn retrieve_docs(
        &self,
        repo_id: Uuid,
        result: &mut KgCandidateResult,
        seen: &mut HashSet<String>,
    ) -> crate::error::Result<()> {
        let max_docs = self.limits.max_kg_docs_total;
        let per_prefix = (max_docs / DOC_PATH_PREFIXES.len()).max(1);

        for prefix in DOC_PATH_PREFIXES {
            if result.stats.docs_retrieved >= max_docs {
                break;
            }
            let remaining = max_docs - result.stats.docs_retrieved;
            let limit = per_prefix.min(remaining);

            let docs = self.kg.get_text_nodes(repo_id, prefix, limit).await?;
            for node in docs {
                if !seen.insert(node.node_id.clone()) {
                    continue;
                }
                result.stats.docs_retrieved += 1;
                result.docs.push(KgCandidate {
                    candidate_type: CandidateType::Doc,
                    node,
                    relationship: None,
                    source_symbol_id: None,
                    source_file: None,
                    path_prefix: Some(prefix.to_string()),
                });
            }
        }

        Ok(())
    }
}
