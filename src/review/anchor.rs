//! Deterministic finding anchoring.
//!
//! Maps each finding to a `(hunk_id, line_in_hunk)` position using three
//! strategies in fixed order: evidence citation, the LLM's own hints, and
//! a file-level fallback. A position is valid iff the `(file, hunk)` pair
//! is an allowed anchor and the line index is inside the hunk. Findings
//! for files outside the diff are never anchored.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::diff::{DiffMappings, Hunk};
use crate::pack::ContextPack;

use super::schema::Finding;

const EVIDENCE_CONFIDENCE: f32 = 0.9;
const HINT_CONFIDENCE: f32 = 0.7;
const FALLBACK_ADDED_CONFIDENCE: f32 = 0.5;
const FALLBACK_FIRST_LINE_CONFIDENCE: f32 = 0.4;

/// How a finding was anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchoringMethod {
    Evidence,
    Hint,
    Fallback,
    /// Anchoring itself was unavailable; finding kept for the summary only
    Degraded,
}

impl std::fmt::Display for AnchoringMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnchoringMethod::Evidence => write!(f, "evidence"),
            AnchoringMethod::Hint => write!(f, "hint"),
            AnchoringMethod::Fallback => write!(f, "fallback"),
            AnchoringMethod::Degraded => write!(f, "degraded"),
        }
    }
}

/// A finding with a validated diff position.
#[derive(Debug, Clone, Serialize)]
pub struct AnchoredFinding {
    pub finding: Finding,
    pub hunk_id: String,
    /// 0-based index into the hunk's lines
    pub line_in_hunk: usize,
    pub anchoring_method: AnchoringMethod,
    pub anchoring_confidence: f32,
}

/// Counters per anchoring pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnchoringStats {
    pub total_findings: usize,
    pub anchored_count: usize,
    pub unanchored_count: usize,
    pub success_rate: f32,
    /// Method name -> count, including "none" for unanchored findings
    pub methods: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation_reason: Option<String>,
}

/// Disjoint anchored/unanchored lists plus stats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnchorOutcome {
    pub anchored: Vec<AnchoredFinding>,
    pub unanchored: Vec<Finding>,
    pub stats: AnchoringStats,
}

/// Anchor every finding against the diff mappings and context pack.
pub fn anchor_findings(
    findings: &[Finding],
    mappings: &DiffMappings,
    pack: &ContextPack,
) -> AnchorOutcome {
    let mut outcome = AnchorOutcome::default();
    outcome.stats.total_findings = findings.len();

    for finding in findings {
        match anchor_one(finding, mappings, pack) {
            Some(anchored) => {
                *outcome
                    .stats
                    .methods
                    .entry(anchored.anchoring_method.to_string())
                    .or_insert(0) += 1;
                outcome.anchored.push(anchored);
            }
            None => {
                *outcome.stats.methods.entry("none".to_string()).or_insert(0) += 1;
                outcome.unanchored.push(finding.clone());
            }
        }
    }

    outcome.stats.anchored_count = outcome.anchored.len();
    outcome.stats.unanchored_count = outcome.unanchored.len();
    outcome.stats.success_rate =
        outcome.anchored.len() as f32 / (findings.len().max(1)) as f32;

    info!(
        "anchoring complete: {}/{} findings anchored",
        outcome.stats.anchored_count, outcome.stats.total_findings
    );
    outcome
}

/// Total-failure path: every finding survives unanchored, tagged degraded.
pub fn degraded(findings: &[Finding], reason: &str) -> AnchorOutcome {
    let mut methods = BTreeMap::new();
    if !findings.is_empty() {
        methods.insert(AnchoringMethod::Degraded.to_string(), findings.len());
    }
    AnchorOutcome {
        anchored: Vec::new(),
        unanchored: findings.to_vec(),
        stats: AnchoringStats {
            total_findings: findings.len(),
            anchored_count: 0,
            unanchored_count: findings.len(),
            success_rate: 0.0,
            methods,
            degradation_reason: Some(reason.to_string()),
        },
    }
}

fn anchor_one(
    finding: &Finding,
    mappings: &DiffMappings,
    pack: &ContextPack,
) -> Option<AnchoredFinding> {
    // Files outside the diff are never anchored
    if !mappings.all_file_paths.contains(&finding.file_path) {
        debug!("file not in diff: {}", finding.file_path);
        return None;
    }

    if let Some(anchored) = anchor_via_evidence(finding, mappings, pack) {
        return Some(anchored);
    }
    if let Some(anchored) = anchor_via_hint(finding, mappings) {
        return Some(anchored);
    }
    anchor_via_fallback(finding, mappings)
}

/// Strategy 1: resolve the cited context item to an absolute line, then
/// map it through the line lookup. Most accurate — it points at the code
/// the model actually cited.
fn anchor_via_evidence(
    finding: &Finding,
    mappings: &DiffMappings,
    pack: &ContextPack,
) -> Option<AnchoredFinding> {
    let evidence = finding.evidence.as_ref()?;
    let item = pack.item(&evidence.context_item_id)?;

    let target_line = match evidence.snippet_line_range.first() {
        Some(offset) => item.start_line + offset,
        None => item.start_line,
    };

    let (hunk_id, line_in_hunk) = mappings.hunk_for_line(&finding.file_path, target_line)?;
    build_anchored(
        finding,
        mappings,
        hunk_id.to_string(),
        line_in_hunk,
        AnchoringMethod::Evidence,
        EVIDENCE_CONFIDENCE,
    )
}

/// Strategy 2: validate the LLM's own hunk/line hints.
fn anchor_via_hint(finding: &Finding, mappings: &DiffMappings) -> Option<AnchoredFinding> {
    let hunk_id = finding.hunk_id.as_deref()?;
    if !mappings.is_valid_anchor(&finding.file_path, hunk_id) {
        debug!("invalid hunk hint {hunk_id} for {}", finding.file_path);
        return None;
    }
    let hunk = mappings.hunk(&finding.file_path, hunk_id)?;

    let line_in_hunk = match finding.line_hint {
        Some(hint) if (hint as usize) < hunk.line_count() => hint as usize,
        Some(hint) => {
            // Out of hunk bounds: read it as an absolute new-file line,
            // accepted only when it maps back into the hinted hunk
            match mappings.hunk_for_line(&finding.file_path, hint) {
                Some((mapped_id, mapped_line)) if mapped_id == hunk_id => mapped_line,
                _ => first_changed_line(hunk),
            }
        }
        None => first_changed_line(hunk),
    };

    build_anchored(
        finding,
        mappings,
        hunk_id.to_string(),
        line_in_hunk,
        AnchoringMethod::Hint,
        HINT_CONFIDENCE,
    )
}

/// Strategy 3: first hunk with additions, else first hunk line zero.
fn anchor_via_fallback(finding: &Finding, mappings: &DiffMappings) -> Option<AnchoredFinding> {
    let hunks = mappings.file_hunks(&finding.file_path)?;
    if hunks.is_empty() {
        return None;
    }

    for hunk in hunks {
        if let Some(&first_added) = hunk.added_line_indexes().first() {
            return build_anchored(
                finding,
                mappings,
                hunk.hunk_id.clone(),
                first_added,
                AnchoringMethod::Fallback,
                FALLBACK_ADDED_CONFIDENCE,
            );
        }
    }

    build_anchored(
        finding,
        mappings,
        hunks[0].hunk_id.clone(),
        0,
        AnchoringMethod::Fallback,
        FALLBACK_FIRST_LINE_CONFIDENCE,
    )
}

fn first_changed_line(hunk: &Hunk) -> usize {
    hunk.added_line_indexes().first().copied().unwrap_or(0)
}

/// Final validity gate shared by all strategies.
fn build_anchored(
    finding: &Finding,
    mappings: &DiffMappings,
    hunk_id: String,
    line_in_hunk: usize,
    method: AnchoringMethod,
    confidence: f32,
) -> Option<AnchoredFinding> {
    let hunk = mappings.hunk(&finding.file_path, &hunk_id)?;
    if line_in_hunk >= hunk.line_count() {
        return None;
    }
    Some(AnchoredFinding {
        finding: finding.clone(),
        hunk_id,
        line_in_hunk,
        anchoring_method: method,
        anchoring_confidence: confidence,
    })
}
