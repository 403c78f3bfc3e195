//! Staged review pipeline.
//!
//! Stages run sequentially; independent I/O inside a stage fans out under
//! its own bound. Each stage enforces its budgets and degrades or fails
//! with a typed error. Fatal errors mark the run failed and propagate;
//! recoverable ones leave warnings behind and keep the run alive.

use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::diff::{patches_from_changes, DiffMappings, FilePatch};
use crate::error::{ReviewError, Result};
use crate::github::{to_raw_changes, GithubClient};
use crate::kg::{CandidateRetriever, KgCandidate, KgQueryService};
use crate::llm::CompletionClient;
use crate::observe::{BreakerRegistry, MetricsCollector, NodeOutcome, NodeTracker};
use crate::pack::{assemble_pack, ContextPack, PackCandidate};
use crate::publish::{absolute_line, build_submission, Publisher};
use crate::review::{
    anchor_findings, build_prompt, degraded, system_prompt, ReviewGenerator,
};
use crate::seed::{extract_seed_set, SeedSet};
use crate::snippet::{SnippetExtractor, SnippetRequest};
use crate::store::{FindingRecord, ReviewStore};
use crate::types::{CandidateType, Provenance, ReviewRequest};
use crate::workspace::{clone_pr_head, CloneWorkspace};

/// Window extracted for import-neighbor file heads.
const IMPORT_NEIGHBOR_HEAD_LINES: u32 = 30;

/// Everything the context half of the pipeline produced.
#[derive(Debug)]
pub struct ContextAssembly {
    pub patches: Vec<FilePatch>,
    pub mappings: DiffMappings,
    pub seeds: SeedSet,
    pub pack: ContextPack,
    pub warnings: Vec<String>,
    pub total_files_changed: usize,
    pub parseable_files: usize,
    /// Held until publication finishes so snippet paths stay valid
    pub clone: Option<CloneWorkspace>,
}

/// Final run outcome reported to the orchestrator.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunResult {
    pub status: String,
    pub review_run_id: String,
    pub pr_number: u64,
    pub head_sha: String,
    pub published: bool,
    pub github_review_id: Option<i64>,
    pub total_findings: usize,
    pub anchored_findings: usize,
    pub unanchored_findings: usize,
    pub processing_duration_ms: u64,
    pub cost_usd: f64,
    pub warnings: Vec<String>,
    pub error_message: Option<String>,
    pub error_stage: Option<String>,
}

/// Services injected into a run; nothing here is a hidden global.
pub struct PipelineServices<'a, C: CompletionClient> {
    pub config: &'a Config,
    pub github: &'a GithubClient,
    pub kg: Option<&'a KgQueryService>,
    pub llm: &'a C,
    pub store: &'a mut ReviewStore,
    pub metrics: &'a MetricsCollector,
    pub nodes: &'a NodeTracker,
    pub breakers: &'a BreakerRegistry,
}

/// Run the full review pipeline for one request.
pub async fn run_review<C: CompletionClient>(
    services: &mut PipelineServices<'_, C>,
    request: &ReviewRequest,
    cancel: &CancellationToken,
) -> Result<RunResult> {
    let started = Instant::now();
    request.validate()?;

    let run_id = Uuid::new_v4().to_string();
    services
        .store
        .create_run(&run_id, request.pr_number as i64, &services.config.model.model, &request.head_sha)
        .map_err(|e| ReviewError::Config { message: e.to_string() })?;

    match run_stages(services, request, cancel, &run_id, started).await {
        Ok(result) => Ok(result),
        Err(e) => {
            let _ = services
                .store
                .complete_run(&run_id, "failed", Some(&e.to_string()));
            Err(e)
        }
    }
}

async fn run_stages<C: CompletionClient>(
    services: &mut PipelineServices<'_, C>,
    request: &ReviewRequest,
    cancel: &CancellationToken,
    run_id: &str,
    started: Instant,
) -> Result<RunResult> {
    let mut assembly = assemble_context(
        services.config,
        services.github,
        services.kg,
        services.metrics,
        services.nodes,
        services.breakers,
        request,
        cancel,
    )
    .await?;

    // Empty PRs short-circuit with a successful, finding-free run
    if assembly.patches.is_empty() {
        info!("{}#{} carries no changed files", request.github_repo_name, request.pr_number);
        services
            .store
            .complete_run(run_id, "completed", None)
            .map_err(|e| ReviewError::Config { message: e.to_string() })?;
        return Ok(empty_result(run_id, request, assembly.warnings, started));
    }

    check_cancelled(cancel)?;

    // Generation: prompt -> LLM -> normalized output
    let stage_start = Instant::now();
    let prompt = build_prompt(&assembly.patches, &assembly.pack, services.config.limits.max_findings);
    let generation = match services.breakers.llm.check() {
        Ok(()) => {
            let generator = ReviewGenerator::new(
                services.llm,
                &services.config.model,
                services.config.limits.max_findings,
            );
            let generated =
                match tokio::time::timeout(services.config.timeouts.node(), generator.generate(system_prompt(), &prompt))
                    .await
                {
                    Ok(generated) => generated,
                    Err(_) => {
                        warn!("generation node timed out");
                        assembly.warnings.push("node_timeout:generate".to_string());
                        services.breakers.llm.record_failure();
                        none_generation()
                    }
                };
            let transport_failed = generated
                .warnings
                .iter()
                .any(|w| w.starts_with("llm_request_failure"));
            if transport_failed {
                services.breakers.llm.record_failure();
            } else {
                services.breakers.llm.record_success();
            }
            generated
        }
        Err(e) => {
            warn!("LLM circuit open, skipping generation: {e}");
            assembly.warnings.push("circuit_open:llm".to_string());
            none_generation()
        }
    };
    assembly.warnings.extend(generation.warnings.clone());
    record_stage(
        services,
        "generate",
        stage_start,
        !generation.output.findings.is_empty(),
        generation.attempts.saturating_sub(1),
        prompt.len(),
        generation.output.findings.len() * 256,
    );

    // Anchoring
    let stage_start = Instant::now();
    let outcome = if assembly.mappings.is_empty() {
        degraded(&generation.output.findings, "diff mappings unavailable")
    } else {
        anchor_findings(&generation.output.findings, &assembly.mappings, &assembly.pack)
    };
    record_stage(
        services,
        "anchor",
        stage_start,
        outcome.stats.degradation_reason.is_none(),
        0,
        generation.output.findings.len(),
        outcome.anchored.len(),
    );

    // Publication is a cancellation boundary: check before, never during
    check_cancelled(cancel)?;

    let stage_start = Instant::now();
    let submission = build_submission(&generation.output, &outcome, &assembly.mappings);
    let publish_result = match services.breakers.github.check() {
        Ok(()) => {
            let publisher = Publisher::new(services.github, services.config.operational.dry_run);
            let result = publisher
                .publish(&request.github_repo_name, request.pr_number, submission)
                .await;
            if result.published || result.skipped_dry_run {
                services.breakers.github.record_success();
            } else {
                services.breakers.github.record_failure();
            }
            result
        }
        Err(e) => {
            warn!("github circuit open, skipping publish: {e}");
            crate::publish::PublishResult {
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    };
    record_stage(
        services,
        "publish",
        stage_start,
        publish_result.published || publish_result.skipped_dry_run,
        0,
        publish_result.comment_count,
        0,
    );

    // Persist findings and publish state in one transaction
    let records = finding_records(run_id, &outcome, &assembly.mappings);
    services
        .store
        .record_publish(
            run_id,
            publish_result.published,
            publish_result.github_review_id,
            publish_result.error.as_deref(),
            &records,
        )
        .map_err(|e| ReviewError::Config { message: e.to_string() })?;
    services
        .store
        .complete_run(run_id, "completed", None)
        .map_err(|e| ReviewError::Config { message: e.to_string() })?;

    if let Some(error) = &publish_result.error {
        assembly.warnings.push(format!("publish_failed:{error}"));
    }

    services.metrics.record_counter(
        "review_runs_completed",
        1.0,
        &[("repo", &request.github_repo_name)],
    );
    services
        .metrics
        .record_histogram("llm_cost_usd", generation.cost_usd, &[("model", &generation.model)]);

    // Clone released after publication, on this and every earlier exit path
    if let Some(clone) = assembly.clone.take() {
        clone.cleanup();
    }

    Ok(RunResult {
        status: "completed".to_string(),
        review_run_id: run_id.to_string(),
        pr_number: request.pr_number,
        head_sha: request.head_sha.clone(),
        published: publish_result.published,
        github_review_id: publish_result.github_review_id,
        total_findings: generation.output.findings.len(),
        anchored_findings: outcome.anchored.len(),
        unanchored_findings: outcome.unanchored.len(),
        processing_duration_ms: started.elapsed().as_millis() as u64,
        cost_usd: generation.cost_usd,
        warnings: assembly.warnings,
        error_message: None,
        error_stage: None,
    })
}

/// Run the context half only: diff, seeds, KG candidates, snippets, pack.
#[allow(clippy::too_many_arguments)]
pub async fn assemble_context(
    config: &Config,
    github: &GithubClient,
    kg: Option<&KgQueryService>,
    metrics: &MetricsCollector,
    nodes: &NodeTracker,
    breakers: &BreakerRegistry,
    request: &ReviewRequest,
    cancel: &CancellationToken,
) -> Result<ContextAssembly> {
    request.validate()?;
    let mut warnings: Vec<String> = Vec::new();

    // Fetch PR context
    let stage_start = Instant::now();
    breakers.github.check()?;
    let fetch = async {
        let metadata = github
            .get_pull_request(&request.github_repo_name, request.pr_number)
            .await?;
        let entries = github
            .list_pull_request_files(&request.github_repo_name, request.pr_number)
            .await?;
        Ok::<_, ReviewError>((metadata, entries))
    };
    let (metadata, entries) = match fetch.await {
        Ok(ok) => {
            breakers.github.record_success();
            ok
        }
        Err(e) => {
            breakers.github.record_failure();
            return Err(e);
        }
    };

    if metadata.head.sha.to_lowercase() != request.head_sha {
        warnings.push("head_sha_mismatch".to_string());
    }

    // Too-large PRs fail before any KG call
    if entries.len() > config.limits.max_changed_files {
        return Err(ReviewError::PrTooLarge {
            changed_files: entries.len(),
            limit: config.limits.max_changed_files,
        });
    }

    let total_files_changed = entries.len();
    let raw_changes = to_raw_changes(&entries);
    let (patches, skipped) = patches_from_changes(&raw_changes);
    for file in &skipped {
        warnings.push(format!("invalid_diff_format:{file}"));
    }
    let parseable_files = patches.iter().filter(|p| p.is_parseable()).count();

    record_node(
        metrics,
        nodes,
        "fetch_pr_context",
        stage_start,
        true,
        0,
        total_files_changed,
        parseable_files,
    );

    if total_files_changed == 0 {
        return Ok(ContextAssembly {
            patches: Vec::new(),
            mappings: DiffMappings::build(&[]),
            seeds: SeedSet::default(),
            pack: ContextPack::default(),
            warnings,
            total_files_changed,
            parseable_files,
            clone: None,
        });
    }

    if parseable_files == 0 {
        return Err(ReviewError::NoParseableFiles);
    }

    check_cancelled(cancel)?;
    let mappings = DiffMappings::build(&patches);

    // Clone the head; failure degrades to a diff-and-docs-only review
    let stage_start = Instant::now();
    let clone = match clone_pr_head(
        request,
        config.operational.clone_root.as_deref(),
        config.github.resolve_token().as_deref(),
        config.timeouts.clone_timeout(),
        config.operational.keep_clone,
    )
    .await
    {
        Ok(clone) => Some(clone),
        Err(e) => {
            warn!("clone failed, continuing without snippets: {e}");
            warnings.push(format!("clone_failed:{}", e.code()));
            None
        }
    };
    record_node(metrics, nodes, "clone", stage_start, clone.is_some(), 0, 0, 0);

    // Seed extraction
    let seeds = extract_seed_set(&patches, clone.as_ref().map(|c| c.path()), &config.limits);
    warnings.extend(seeds.warnings.clone());
    debug!("{} seed symbols, {} seed files", seeds.symbols.len(), seeds.files.len());

    check_cancelled(cancel)?;

    // KG candidate retrieval with graceful degradation
    let stage_start = Instant::now();
    let kg_result = match kg {
        Some(kg_service) => match breakers.kg.check() {
            Ok(()) => {
                let retriever =
                    CandidateRetriever::new(kg_service, &config.limits, &config.parallelism);
                match tokio::time::timeout(
                    config.timeouts.node(),
                    retriever.retrieve(request.repo_id, &seeds),
                )
                .await
                {
                    Ok(result) => {
                        let had_error =
                            result.warnings.iter().any(|w| w.starts_with("kg_retrieval_error"));
                        if had_error {
                            breakers.kg.record_failure();
                        } else {
                            breakers.kg.record_success();
                        }
                        result
                    }
                    Err(_) => {
                        warn!("KG retrieval node timed out");
                        warnings.push("node_timeout:kg_retrieval".to_string());
                        breakers.kg.record_failure();
                        Default::default()
                    }
                }
            }
            Err(e) => {
                warn!("KG circuit open, skipping retrieval: {e}");
                warnings.push("circuit_open:kg".to_string());
                Default::default()
            }
        },
        None => {
            warnings.push("kg_unconfigured".to_string());
            Default::default()
        }
    };
    warnings.extend(kg_result.warnings.clone());
    record_node(
        metrics,
        nodes,
        "kg_retrieval",
        stage_start,
        !kg_result.warnings.iter().any(|w| w.starts_with("kg_retrieval_error")),
        0,
        seeds.symbols.len() + seeds.files.len(),
        kg_result.stats.total_candidates,
    );

    check_cancelled(cancel)?;

    // Snippets and pack candidates
    let stage_start = Instant::now();
    let candidates = build_pack_candidates(
        config,
        clone.as_ref(),
        &seeds,
        kg_result.flat_candidates(),
        &mut warnings,
    )
    .await;
    record_node(metrics, nodes, "snippets", stage_start, true, 0, 0, candidates.len());

    let changed_lines = changed_lines_by_file(&patches);
    let pack = assemble_pack(
        candidates,
        &changed_lines,
        kg_result.kg_commit_sha.clone(),
        &request.head_sha,
        warnings.clone(),
        &config.limits,
    );

    metrics.record_gauge("pack_items", pack.items.len() as f64, &[]);
    metrics.record_gauge("pack_characters", pack.stats.total_characters as f64, &[]);

    Ok(ContextAssembly {
        warnings: pack.warnings.clone(),
        patches,
        mappings,
        seeds,
        pack,
        total_files_changed,
        parseable_files,
        clone,
    })
}

/// Turn seeds and KG candidates into snippeted pack candidates.
async fn build_pack_candidates(
    config: &Config,
    clone: Option<&CloneWorkspace>,
    seeds: &SeedSet,
    kg_candidates: Vec<&KgCandidate>,
    warnings: &mut Vec<String>,
) -> Vec<PackCandidate> {
    let mut candidates: Vec<PackCandidate> = Vec::new();

    // Doc candidates carry their text in the KG already
    for candidate in &kg_candidates {
        if candidate.candidate_type != CandidateType::Doc {
            continue;
        }
        let Some(text) = candidate.node.text.clone() else {
            continue;
        };
        candidates.push(PackCandidate {
            candidate_type: CandidateType::Doc,
            provenance: Provenance::Doc,
            relationship: None,
            file_path: candidate.node.relative_path.clone().unwrap_or_default(),
            start_line: candidate.node.start_line.unwrap_or(1).max(1) as u32,
            end_line: candidate.node.end_line.unwrap_or(1).max(1) as u32,
            text,
        });
    }

    let Some(clone) = clone else {
        return candidates;
    };
    let mut extractor = match SnippetExtractor::new(clone.path(), &config.limits) {
        Ok(extractor) => extractor,
        Err(e) => {
            warn!("snippet extractor unavailable: {e}");
            warnings.push("snippet_extractor_unavailable".to_string());
            return candidates;
        }
    };

    // File-backed requests: seed symbols, then symbol/import neighbors
    struct Pending {
        request: SnippetRequest,
        candidate_type: CandidateType,
        provenance: Provenance,
        relationship: Option<crate::types::Relationship>,
    }

    let mut pending: Vec<Pending> = Vec::new();
    for symbol in &seeds.symbols {
        pending.push(Pending {
            request: SnippetRequest {
                file_path: symbol.file_path.clone(),
                start_line: Some(symbol.start_line),
                end_line: Some(symbol.end_line),
            },
            candidate_type: CandidateType::SymbolMatch,
            provenance: Provenance::Seed,
            relationship: None,
        });
    }
    for candidate in &kg_candidates {
        let Some(path) = candidate.node.relative_path.clone() else {
            continue;
        };
        match candidate.candidate_type {
            CandidateType::SymbolMatch | CandidateType::Neighbor => {
                pending.push(Pending {
                    request: SnippetRequest {
                        file_path: path,
                        start_line: candidate.node.start_line.map(|l| l.max(1) as u32),
                        end_line: candidate.node.end_line.map(|l| l.max(1) as u32),
                    },
                    candidate_type: candidate.candidate_type,
                    provenance: Provenance::KgNeighbor,
                    relationship: candidate.relationship,
                });
            }
            CandidateType::ImportNeighbor => {
                pending.push(Pending {
                    request: SnippetRequest {
                        file_path: path,
                        start_line: Some(1),
                        end_line: Some(IMPORT_NEIGHBOR_HEAD_LINES),
                    },
                    candidate_type: CandidateType::ImportNeighbor,
                    provenance: Provenance::KgNeighbor,
                    relationship: candidate.relationship,
                });
            }
            CandidateType::Doc => {}
        }
    }

    let requests: Vec<SnippetRequest> = pending.iter().map(|p| p.request.clone()).collect();
    let results = extractor.extract_many(&requests, &config.parallelism).await;

    let mut failed = 0usize;
    for (meta, result) in pending.into_iter().zip(results) {
        if !result.extraction_success {
            failed += 1;
            continue;
        }
        candidates.push(PackCandidate {
            candidate_type: meta.candidate_type,
            provenance: meta.provenance,
            relationship: meta.relationship,
            file_path: result.file_path,
            start_line: result.start_line,
            end_line: result.end_line,
            text: result.content,
        });
    }
    if failed > 0 {
        warnings.push(format!("snippet_failures:{failed}"));
    }

    candidates
}

/// Absolute new-file lines of additions, per file.
fn changed_lines_by_file(patches: &[FilePatch]) -> HashMap<String, Vec<u32>> {
    let mut out: HashMap<String, Vec<u32>> = HashMap::new();
    for patch in patches {
        let lines = out.entry(patch.file_path.clone()).or_default();
        for hunk in &patch.hunks {
            for idx in hunk.added_line_indexes() {
                lines.push(hunk.absolute_new_line(idx));
            }
        }
    }
    out
}

fn finding_records(
    run_id: &str,
    outcome: &crate::review::AnchorOutcome,
    mappings: &DiffMappings,
) -> Vec<FindingRecord> {
    let mut records = Vec::with_capacity(outcome.anchored.len() + outcome.unanchored.len());
    for anchored in &outcome.anchored {
        records.push(FindingRecord::new(
            run_id,
            &anchored.finding.file_path,
            absolute_line(mappings, anchored),
            &anchored.finding.category.to_string(),
            &anchored.finding.severity.to_string(),
            &anchored.finding.message,
            &anchored.finding.suggested_fix,
        ));
    }
    for finding in &outcome.unanchored {
        records.push(FindingRecord::new(
            run_id,
            &finding.file_path,
            None,
            &finding.category.to_string(),
            &finding.severity.to_string(),
            &finding.message,
            &finding.suggested_fix,
        ));
    }
    records
}

fn empty_result(
    run_id: &str,
    request: &ReviewRequest,
    warnings: Vec<String>,
    started: Instant,
) -> RunResult {
    RunResult {
        status: "completed".to_string(),
        review_run_id: run_id.to_string(),
        pr_number: request.pr_number,
        head_sha: request.head_sha.clone(),
        published: false,
        github_review_id: None,
        total_findings: 0,
        anchored_findings: 0,
        unanchored_findings: 0,
        processing_duration_ms: started.elapsed().as_millis() as u64,
        cost_usd: 0.0,
        warnings,
        error_message: None,
        error_stage: None,
    }
}

fn none_generation() -> crate::review::GenerationResult {
    crate::review::GenerationResult {
        output: crate::review::ReviewOutput::empty("Review generation unavailable."),
        warnings: Vec::new(),
        usage: Default::default(),
        cost_usd: 0.0,
        model: String::new(),
        attempts: 0,
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ReviewError::Cancelled);
    }
    Ok(())
}

fn record_stage<C: CompletionClient>(
    services: &PipelineServices<'_, C>,
    node: &str,
    start: Instant,
    success: bool,
    retries: u32,
    input_bytes: usize,
    output_bytes: usize,
) {
    record_node(
        services.metrics,
        services.nodes,
        node,
        start,
        success,
        retries,
        input_bytes,
        output_bytes,
    );
}

#[allow(clippy::too_many_arguments)]
fn record_node(
    metrics: &MetricsCollector,
    nodes: &NodeTracker,
    node: &str,
    start: Instant,
    success: bool,
    retries: u32,
    input_bytes: usize,
    output_bytes: usize,
) {
    let duration_ms = start.elapsed().as_millis() as u64;
    metrics.record_histogram("stage_duration_ms", duration_ms as f64, &[("stage", node)]);
    if !success {
        metrics.record_counter("stage_errors", 1.0, &[("stage", node)]);
    }
    nodes.record(NodeOutcome {
        node: node.to_string(),
        success,
        duration_ms,
        input_bytes,
        output_bytes,
        retries,
        timed_out: false,
        error_class: None,
    });
}
