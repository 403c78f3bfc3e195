//! Context ranking and budgeted pack assembly.
//!
//! Scores candidates, orders them stably, and admits them greedily under
//! the joint hard caps on item count and total characters. Assembly is
//! pure: the same inputs always produce the same pack.

mod rank;

pub use rank::score_candidate;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::LimitsConfig;
use crate::types::{CandidateType, Provenance, Relationship};

/// Oversized items are cut to this fraction of the total character budget.
const PER_ITEM_BUDGET_FRACTION: usize = 4;

/// A scored-and-snippeted candidate ready for packing.
#[derive(Debug, Clone)]
pub struct PackCandidate {
    pub candidate_type: CandidateType,
    pub provenance: Provenance,
    pub relationship: Option<Relationship>,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
}

/// One admitted context item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    /// Stable within the pack: `ctx_1`, `ctx_2`, ...
    pub item_id: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
    pub provenance: Provenance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<Relationship>,
    pub relevance_score: f32,
    pub character_count: usize,
}

/// Counters describing one assembly pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackStats {
    pub candidates_considered: usize,
    pub admitted: usize,
    pub dropped_budget: usize,
    pub dropped_oversize: usize,
    pub truncated: usize,
    pub total_characters: usize,
}

/// The bounded, ordered context bundle delivered to the LLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextPack {
    pub items: Vec<ContextItem>,
    pub stats: PackStats,
    /// Commit the KG was built from; differing from the PR head is the
    /// drift signal, surfaced as a warning
    pub kg_commit_sha: Option<String>,
    pub warnings: Vec<String>,
}

impl ContextPack {
    pub fn item(&self, item_id: &str) -> Option<&ContextItem> {
        self.items.iter().find(|i| i.item_id == item_id)
    }
}

/// Score, order, and pack candidates under the joint budgets.
///
/// `changed_lines` maps file paths to absolute new-file line numbers of
/// additions, for the proximity term. `head_sha` is compared against
/// `kg_commit_sha` to emit the `kg_drift` warning.
pub fn assemble_pack(
    candidates: Vec<PackCandidate>,
    changed_lines: &HashMap<String, Vec<u32>>,
    kg_commit_sha: Option<String>,
    head_sha: &str,
    mut warnings: Vec<String>,
    limits: &LimitsConfig,
) -> ContextPack {
    let mut stats = PackStats {
        candidates_considered: candidates.len(),
        ..Default::default()
    };

    if let Some(sha) = &kg_commit_sha {
        if sha != head_sha && !warnings.iter().any(|w| w == "kg_drift") {
            warnings.push("kg_drift".to_string());
        }
    }

    // Stable order: score descending, ties broken by
    // (candidate_type, file_path, start_line).
    let mut scored: Vec<(PackCandidate, f32)> = candidates
        .into_iter()
        .map(|c| {
            let score = score_candidate(&c, changed_lines);
            (c, score)
        })
        .collect();
    scored.sort_by(|(a, sa), (b, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| type_rank(a.candidate_type).cmp(&type_rank(b.candidate_type)))
            .then_with(|| a.file_path.cmp(&b.file_path))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });

    let per_item_limit = (limits.max_total_characters / PER_ITEM_BUDGET_FRACTION).max(1);
    let mut items: Vec<ContextItem> = Vec::new();
    let mut total_characters = 0usize;

    for (candidate, score) in scored {
        if items.len() >= limits.max_context_items {
            stats.dropped_budget += 1;
            continue;
        }

        let mut text = candidate.text;
        let mut char_count = text.chars().count();
        let mut truncated = false;

        if char_count > per_item_limit {
            text = text.chars().take(per_item_limit).collect();
            char_count = per_item_limit;
            truncated = true;
        }

        if total_characters + char_count > limits.max_total_characters {
            if truncated {
                // Already cut to the per-item bound and still does not fit
                stats.dropped_oversize += 1;
            } else {
                stats.dropped_budget += 1;
            }
            continue;
        }

        if truncated {
            stats.truncated += 1;
        }
        total_characters += char_count;
        items.push(ContextItem {
            item_id: format!("ctx_{}", items.len() + 1),
            file_path: candidate.file_path,
            start_line: candidate.start_line,
            end_line: candidate.end_line,
            text,
            provenance: candidate.provenance,
            relationship: candidate.relationship,
            relevance_score: score,
            character_count: char_count,
        });
    }

    stats.admitted = items.len();
    stats.total_characters = total_characters;
    debug!(
        "pack assembled: {} items, {} chars, {} dropped",
        stats.admitted,
        stats.total_characters,
        stats.dropped_budget + stats.dropped_oversize
    );

    ContextPack {
        items,
        stats,
        kg_commit_sha,
        warnings,
    }
}

fn type_rank(candidate_type: CandidateType) -> u8 {
    match candidate_type {
        CandidateType::SymbolMatch => 0,
        CandidateType::Neighbor => 1,
        CandidateType::ImportNeighbor => 2,
        CandidateType::Doc => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn seed_candidate(file: &str, start: u32, text: &str) -> PackCandidate {
        PackCandidate {
            candidate_type: CandidateType::SymbolMatch,
            provenance: Provenance::Seed,
            relationship: None,
            file_path: file.to_string(),
            start_line: start,
            end_line: start + 5,
            text: text.to_string(),
        }
    }

    fn doc_candidate(file: &str, text: &str) -> PackCandidate {
        PackCandidate {
            candidate_type: CandidateType::Doc,
            provenance: Provenance::Doc,
            relationship: None,
            file_path: file.to_string(),
            start_line: 1,
            end_line: 10,
            text: text.to_string(),
        }
    }

    fn limits(items: usize, chars: usize) -> LimitsConfig {
        LimitsConfig {
            max_context_items: items,
            max_total_characters: chars,
            ..Default::default()
        }
    }

    #[test]
    fn test_budgets_enforced_jointly() {
        let candidates = vec![
            seed_candidate("a.rs", 1, &"x".repeat(40)),
            seed_candidate("b.rs", 1, &"y".repeat(40)),
            seed_candidate("c.rs", 1, &"z".repeat(40)),
        ];
        let pack = assemble_pack(
            candidates,
            &HashMap::new(),
            None,
            &"a".repeat(40),
            vec![],
            &limits(10, 100),
        );

        assert_eq!(pack.items.len(), 2);
        assert!(pack.stats.total_characters <= 100);
        assert_eq!(pack.stats.dropped_budget, 1);
    }

    #[test]
    fn test_item_cap_enforced() {
        let candidates: Vec<PackCandidate> =
            (0..5).map(|i| seed_candidate(&format!("f{i}.rs"), 1, "abc")).collect();
        let pack = assemble_pack(
            candidates,
            &HashMap::new(),
            None,
            &"a".repeat(40),
            vec![],
            &limits(2, 10_000),
        );

        assert_eq!(pack.items.len(), 2);
        assert_eq!(pack.stats.dropped_budget, 3);
    }

    #[test]
    fn test_oversize_item_truncated_to_prefix() {
        let candidates = vec![seed_candidate("a.rs", 1, &"x".repeat(5_000))];
        let pack = assemble_pack(
            candidates,
            &HashMap::new(),
            None,
            &"a".repeat(40),
            vec![],
            &limits(10, 4_000),
        );

        // Per-item limit = 4000 / 4 = 1000
        assert_eq!(pack.items.len(), 1);
        assert_eq!(pack.items[0].character_count, 1_000);
        assert_eq!(pack.stats.truncated, 1);
    }

    #[test]
    fn test_item_ids_sequential_and_unique() {
        let candidates: Vec<PackCandidate> =
            (0..4).map(|i| seed_candidate(&format!("f{i}.rs"), 1, "text")).collect();
        let pack = assemble_pack(
            candidates,
            &HashMap::new(),
            None,
            &"a".repeat(40),
            vec![],
            &limits(10, 10_000),
        );

        let ids: Vec<&str> = pack.items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["ctx_1", "ctx_2", "ctx_3", "ctx_4"]);
    }

    #[test]
    fn test_character_count_matches_text() {
        let candidates = vec![seed_candidate("a.rs", 1, "héllo wörld")];
        let pack = assemble_pack(
            candidates,
            &HashMap::new(),
            None,
            &"a".repeat(40),
            vec![],
            &limits(10, 10_000),
        );
        let item = &pack.items[0];
        assert_eq!(item.character_count, item.text.chars().count());
    }

    #[test]
    fn test_kg_drift_warning() {
        let head = "a".repeat(40);
        let pack = assemble_pack(
            vec![],
            &HashMap::new(),
            Some("b".repeat(40)),
            &head,
            vec![],
            &limits(10, 100),
        );
        assert!(pack.warnings.contains(&"kg_drift".to_string()));

        let no_drift = assemble_pack(
            vec![],
            &HashMap::new(),
            Some(head.clone()),
            &head,
            vec![],
            &limits(10, 100),
        );
        assert!(!no_drift.warnings.contains(&"kg_drift".to_string()));
    }

    #[test]
    fn test_scores_non_increasing_within_provenance() {
        let changed = HashMap::from([("a.rs".to_string(), vec![3u32])]);
        let candidates = vec![
            doc_candidate("README.md", "docs"),
            seed_candidate("z.rs", 1, "far"),
            seed_candidate("a.rs", 1, "near"),
        ];
        let pack = assemble_pack(
            candidates,
            &changed,
            None,
            &"a".repeat(40),
            vec![],
            &limits(10, 10_000),
        );

        for provenance in [Provenance::Seed, Provenance::Doc] {
            let scores: Vec<f32> = pack
                .items
                .iter()
                .filter(|i| i.provenance == provenance)
                .map(|i| i.relevance_score)
                .collect();
            assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        }
    }

    #[test]
    fn test_deterministic_assembly() {
        let make = || {
            vec![
                seed_candidate("b.rs", 1, "one"),
                seed_candidate("a.rs", 1, "two"),
                doc_candidate("README.md", "three"),
            ]
        };
        let head = "a".repeat(40);
        let p1 = serde_json::to_string(&assemble_pack(
            make(),
            &HashMap::new(),
            None,
            &head,
            vec![],
            &limits(10, 100),
        ))
        .unwrap();
        let p2 = serde_json::to_string(&assemble_pack(
            make(),
            &HashMap::new(),
            None,
            &head,
            vec![],
            &limits(10, 100),
        ))
        .unwrap();
        assert_eq!(p1, p2);
    }

    proptest! {
        /// Joint budget invariants hold for arbitrary candidate sets, and
        /// tightening a budget never increases any output count.
        #[test]
        fn prop_budgets_hold_and_are_monotone(
            texts in proptest::collection::vec(1usize..400, 0..30),
            max_items in 1usize..20,
            max_chars in 50usize..2_000,
        ) {
            let make = |n: &Vec<usize>| -> Vec<PackCandidate> {
                n.iter()
                    .enumerate()
                    .map(|(i, len)| seed_candidate(&format!("f{i}.rs"), 1, &"x".repeat(*len)))
                    .collect()
            };

            let head = "a".repeat(40);
            let pack = assemble_pack(
                make(&texts),
                &HashMap::new(),
                None,
                &head,
                vec![],
                &limits(max_items, max_chars),
            );
            prop_assert!(pack.items.len() <= max_items);
            let total: usize = pack.items.iter().map(|i| i.character_count).sum();
            prop_assert!(total <= max_chars);
            prop_assert_eq!(total, pack.stats.total_characters);

            // Monotone budgets: halving both caps never admits more
            let tight = assemble_pack(
                make(&texts),
                &HashMap::new(),
                None,
                &head,
                vec![],
                &limits((max_items / 2).max(1), (max_chars / 2).max(1)),
            );
            prop_assert!(tight.items.len() <= pack.items.len());
            prop_assert!(tight.stats.total_characters <= pack.stats.total_characters);
        }
    }
}
