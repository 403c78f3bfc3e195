//! Deterministic prompt construction.
//!
//! The same diff and pack must produce byte-identical prompts: section
//! order, whitespace, and delimiters are fixed, and the embedded JSON
//! schema serializes with sorted keys.

use crate::diff::{FilePatch, LineTag};
use crate::pack::ContextPack;

/// Fixed role/task preamble sent as the system message.
pub fn system_prompt() -> &'static str {
    "You are a precise senior code reviewer. You examine pull request diffs \
     together with repository context and produce structured findings. You \
     only report issues you can ground in the provided material, you prefer \
     fewer high-confidence findings over speculation, and you always answer \
     with a single JSON object matching the requested schema."
}

/// Build the user prompt: diff, context pack, output schema, grounding rule.
pub fn build_prompt(patches: &[FilePatch], pack: &ContextPack, max_findings: usize) -> String {
    let mut out = String::with_capacity(16 * 1024);

    out.push_str("# Pull request review task\n\n");
    out.push_str(
        "Review the following changes. Judge correctness, security, performance, \
         design, and maintainability. Report at most ",
    );
    out.push_str(&max_findings.to_string());
    out.push_str(" findings.\n\n");

    out.push_str("## Diff\n\n");
    for patch in patches {
        render_patch(&mut out, patch);
    }

    out.push_str("## Repository context\n\n");
    if pack.items.is_empty() {
        out.push_str("(no additional context available)\n\n");
    }
    for item in &pack.items {
        let relationship = item
            .relationship
            .map(|r| format!("/{r}"))
            .unwrap_or_default();
        out.push_str(&format!(
            "[{}] {}:{}-{} ({}{}, score {:.2})\n```\n{}\n```\n\n",
            item.item_id,
            item.file_path,
            item.start_line,
            item.end_line,
            item.provenance,
            relationship,
            item.relevance_score,
            item.text
        ));
    }

    out.push_str("## Output schema\n\n");
    out.push_str("Respond with exactly one JSON object of this shape:\n\n```json\n");
    out.push_str(&output_schema_json());
    out.push_str("\n```\n\n");

    out.push_str("## Grounding rule\n\n");
    out.push_str(
        "Every finding MUST cite either an `evidence.context_item_id` taken from \
         the repository context above, or a `hunk_id` taken from the diff. \
         Findings about files that do not appear in the diff are discarded.\n",
    );

    out
}

fn render_patch(out: &mut String, patch: &FilePatch) {
    out.push_str(&format!("### {} ({})\n", patch.file_path, patch.change_type));
    if let Some(previous) = &patch.previous_path {
        out.push_str(&format!("renamed from {previous}\n"));
    }
    if patch.is_binary {
        out.push_str("(binary file, content omitted)\n\n");
        return;
    }
    if patch.hunks.is_empty() {
        out.push_str("(no content changes)\n\n");
        return;
    }
    for hunk in &patch.hunks {
        out.push_str(&format!(
            "[{}] @@ -{},{} +{},{} @@\n",
            hunk.hunk_id, hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count
        ));
        for line in &hunk.lines {
            match line.tag {
                LineTag::Context => {
                    out.push(' ');
                    out.push_str(&line.text);
                }
                LineTag::Addition => {
                    out.push('+');
                    out.push_str(&line.text);
                }
                LineTag::Deletion => {
                    out.push('-');
                    out.push_str(&line.text);
                }
                LineTag::NoEol => out.push_str(&line.text),
            }
            out.push('\n');
        }
    }
    out.push('\n');
}

/// The finding schema embedded in every prompt.
///
/// `serde_json` keeps object keys sorted, which makes this rendering
/// deterministic.
fn output_schema_json() -> String {
    let schema = serde_json::json!({
        "findings": [{
            "finding_id": "finding_1 (sequential from 1)",
            "severity": "blocker | high | medium | low | nit",
            "category": "bug | security | performance | style | design | docs | observability | maintainability",
            "title": "short title, max 255 chars",
            "message": "detailed explanation, min 10 chars",
            "suggested_fix": "actionable fix, min 10 chars",
            "file_path": "path of the affected file",
            "hunk_id": "optional hunk id from the diff",
            "line_hint": "optional line number",
            "confidence": "0.0 to 1.0",
            "evidence": {
                "context_item_id": "ctx_N from the repository context",
                "snippet_line_range": [0]
            },
            "related_symbols": ["symbol names"],
            "code_examples": ["max 3 snippets"]
        }],
        "summary": "overall review summary, min 20 chars",
        "patterns": ["max 5 repository-wide patterns"],
        "recommendations": ["max 3 general recommendations"],
        "total_findings": "must equal findings length",
        "high_confidence_findings": "count of findings with confidence >= 0.7",
        "review_timestamp": "ISO 8601 timestamp"
    });
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::parse_patch;
    use crate::pack::{ContextItem, PackStats};
    use crate::types::{ChangeType, Provenance};

    fn sample_patches() -> Vec<FilePatch> {
        vec![FilePatch {
            file_path: "src/test.py".to_string(),
            change_type: ChangeType::Modified,
            previous_path: None,
            additions: 3,
            deletions: 1,
            changes: 4,
            hunks: parse_patch(
                "src/test.py",
                "@@ -1,3 +1,6 @@\n def test():\n-    return False\n+    # Updated\n+    result = calculate()\n+    return result",
            )
            .unwrap(),
            is_binary: false,
        }]
    }

    fn sample_pack() -> ContextPack {
        ContextPack {
            items: vec![ContextItem {
                item_id: "ctx_1".to_string(),
                file_path: "src/calc.py".to_string(),
                start_line: 1,
                end_line: 4,
                text: "def calculate():\n    return 42".to_string(),
                provenance: Provenance::KgNeighbor,
                relationship: Some(crate::types::Relationship::Callee),
                relevance_score: 0.9,
                character_count: 30,
            }],
            stats: PackStats::default(),
            kg_commit_sha: None,
            warnings: vec![],
        }
    }

    #[test]
    fn test_prompt_is_byte_identical_for_same_inputs() {
        let patches = sample_patches();
        let pack = sample_pack();
        let p1 = build_prompt(&patches, &pack, 12);
        let p2 = build_prompt(&patches, &pack, 12);
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_prompt_shows_hunk_and_item_ids() {
        let prompt = build_prompt(&sample_patches(), &sample_pack(), 12);
        assert!(prompt.contains("[hunk_1] @@ -1,3 +1,6 @@"));
        assert!(prompt.contains("[ctx_1] src/calc.py:1-4"));
        assert!(prompt.contains("+    result = calculate()"));
    }

    #[test]
    fn test_prompt_contains_schema_and_grounding_rule() {
        let prompt = build_prompt(&sample_patches(), &sample_pack(), 12);
        assert!(prompt.contains("\"finding_id\""));
        assert!(prompt.contains("Grounding rule"));
        assert!(prompt.contains("evidence.context_item_id"));
    }

    #[test]
    fn test_binary_patch_rendered_without_content() {
        let patches = vec![FilePatch {
            file_path: "logo.png".to_string(),
            change_type: ChangeType::Added,
            previous_path: None,
            additions: 0,
            deletions: 0,
            changes: 0,
            hunks: vec![],
            is_binary: true,
        }];
        let prompt = build_prompt(&patches, &sample_pack(), 12);
        assert!(prompt.contains("### logo.png (added)"));
        assert!(prompt.contains("content omitted"));
    }

    #[test]
    fn test_empty_pack_placeholder() {
        let pack = ContextPack::default();
        let prompt = build_prompt(&sample_patches(), &pack, 12);
        assert!(prompt.contains("(no additional context available)"));
    }
}
