//! Structured review output: tolerant parsing, normalization, validation.
//!
//! Raw LLM output is parsed with per-field defaults, then normalized into
//! the strict internal schema: severity/category aliases coerced, finding
//! ids renumbered sequentially, counters recomputed, arrays clipped to the
//! schema maxima. Validation re-checks the invariants the rest of the
//! pipeline depends on.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diff::normalize_path;
use crate::error::{ReviewError, Result};
use crate::types::{Category, Severity};

/// Hard schema cap on findings per review.
pub const MAX_FINDINGS_SCHEMA: usize = 20;
/// Confidence at or above which a finding counts as high-confidence.
pub const HIGH_CONFIDENCE_THRESHOLD: f32 = 0.7;

const MAX_TITLE_CHARS: usize = 255;
const MIN_MESSAGE_CHARS: usize = 10;
const MIN_SUMMARY_CHARS: usize = 20;
const MAX_CODE_EXAMPLES: usize = 3;
const MAX_PATTERNS: usize = 5;
const MAX_RECOMMENDATIONS: usize = 3;

/// Evidence citation tying a finding to a context item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub context_item_id: String,
    /// 0-based line offsets into the cited snippet
    #[serde(default)]
    pub snippet_line_range: Vec<u32>,
}

/// A normalized review finding, before anchoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// `finding_N`, sequential from 1 within the review
    pub finding_id: String,
    pub severity: Severity,
    pub category: Category,
    pub title: String,
    pub message: String,
    pub suggested_fix: String,
    pub file_path: String,
    /// LLM's hunk hint, validated later by the anchorer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hunk_id: Option<String>,
    /// LLM's line hint: a hunk offset or an absolute new-file line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_hint: Option<u32>,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    #[serde(default)]
    pub related_symbols: Vec<String>,
    #[serde(default)]
    pub code_examples: Vec<String>,
}

impl Finding {
    pub fn is_high_confidence(&self) -> bool {
        self.confidence >= HIGH_CONFIDENCE_THRESHOLD
    }
}

/// The normalized review payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutput {
    pub findings: Vec<Finding>,
    pub summary: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub total_findings: usize,
    pub high_confidence_findings: usize,
    pub review_timestamp: String,
}

impl ReviewOutput {
    /// Empty output used when generation fails terminally.
    pub fn empty(summary: &str) -> Self {
        Self {
            findings: Vec::new(),
            summary: summary.to_string(),
            patterns: Vec::new(),
            recommendations: Vec::new(),
            total_findings: 0,
            high_confidence_findings: 0,
            review_timestamp: Utc::now().to_rfc3339(),
        }
    }
}

// Raw shapes with per-field defaults so a partially-wrong response still
// yields whatever it got right.

#[derive(Debug, Deserialize)]
struct RawReviewOutput {
    #[serde(default)]
    findings: Vec<RawFinding>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    patterns: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    review_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFinding {
    #[serde(default)]
    severity: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    suggested_fix: String,
    #[serde(default)]
    file_path: String,
    #[serde(default)]
    hunk_id: Option<String>,
    #[serde(default)]
    line_hint: Option<u32>,
    #[serde(default = "default_confidence")]
    confidence: f32,
    #[serde(default)]
    evidence: Option<RawEvidence>,
    #[serde(default)]
    related_symbols: Vec<String>,
    #[serde(default)]
    code_examples: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawEvidence {
    #[serde(default)]
    context_item_id: String,
    #[serde(default)]
    snippet_line_range: Vec<u32>,
}

fn default_confidence() -> f32 {
    0.5
}

/// Extract the JSON object from a completion, tolerating fenced code
/// blocks and leading/trailing prose.
pub fn extract_json(content: &str) -> Result<serde_json::Value> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    // Fenced block: ```json ... ``` or bare ```
    if let Some(fence_start) = trimmed.find("```") {
        let after = &trimmed[fence_start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let body = body.split("```").next().unwrap_or(body);
        if let Ok(value) = serde_json::from_str(body.trim()) {
            return Ok(value);
        }
    }

    // Outermost braces
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(ReviewError::LlmSchemaFailure {
        message: "no JSON object found in completion".to_string(),
    })
}

/// Normalize a raw JSON value into the strict schema.
///
/// Returns the output plus warnings for every coercion that lost
/// information. Fails only when the response is beyond repair (missing or
/// too-short summary).
pub fn normalize(value: serde_json::Value, max_findings: usize) -> Result<(ReviewOutput, Vec<String>)> {
    let raw: RawReviewOutput = serde_json::from_value(value)
        .map_err(|e| ReviewError::LlmSchemaFailure { message: format!("shape mismatch: {e}") })?;

    let mut warnings = Vec::new();

    let summary = raw.summary.trim().to_string();
    if summary.chars().count() < MIN_SUMMARY_CHARS {
        return Err(ReviewError::LlmSchemaFailure {
            message: format!(
                "summary must be at least {MIN_SUMMARY_CHARS} characters, got {}",
                summary.chars().count()
            ),
        });
    }

    let cap = max_findings.min(MAX_FINDINGS_SCHEMA);
    if raw.findings.len() > cap {
        warnings.push(format!("findings_clipped:{}", raw.findings.len() - cap));
    }

    let mut findings = Vec::new();
    for raw_finding in raw.findings.into_iter() {
        if findings.len() >= cap {
            break;
        }
        match normalize_finding(raw_finding, findings.len() + 1, &mut warnings) {
            Some(finding) => findings.push(finding),
            None => debug!("dropped malformed finding"),
        }
    }

    // Ids were assigned against a running count that skips dropped
    // findings, so they are already `finding_1..N`; recompute the counters.
    let total_findings = findings.len();
    let high_confidence_findings = findings.iter().filter(|f| f.is_high_confidence()).count();

    let output = ReviewOutput {
        findings,
        summary,
        patterns: clip(raw.patterns, MAX_PATTERNS),
        recommendations: clip(raw.recommendations, MAX_RECOMMENDATIONS),
        total_findings,
        high_confidence_findings,
        review_timestamp: raw
            .review_timestamp
            .unwrap_or_else(|| Utc::now().to_rfc3339()),
    };

    Ok((output, warnings))
}

fn normalize_finding(
    raw: RawFinding,
    next_ordinal: usize,
    warnings: &mut Vec<String>,
) -> Option<Finding> {
    let title: String = raw.title.trim().chars().take(MAX_TITLE_CHARS).collect();
    if title.is_empty() {
        warnings.push("finding_dropped:empty_title".to_string());
        return None;
    }

    let message = raw.message.trim().to_string();
    if message.chars().count() < MIN_MESSAGE_CHARS {
        warnings.push("finding_dropped:short_message".to_string());
        return None;
    }

    let suggested_fix = raw.suggested_fix.trim().to_string();
    if suggested_fix.chars().count() < MIN_MESSAGE_CHARS {
        warnings.push("finding_dropped:short_fix".to_string());
        return None;
    }

    let file_path = normalize_path(raw.file_path.trim());
    if file_path.is_empty() {
        warnings.push("finding_dropped:empty_file_path".to_string());
        return None;
    }

    let severity = Severity::from_alias(&raw.severity).unwrap_or_else(|| {
        warnings.push(format!("severity_alias_unknown:{}", raw.severity.trim()));
        Severity::Medium
    });
    let category = Category::from_alias(&raw.category).unwrap_or_else(|| {
        warnings.push(format!("category_alias_unknown:{}", raw.category.trim()));
        Category::Maintainability
    });

    let evidence = raw.evidence.and_then(|e| {
        if e.context_item_id.trim().is_empty() {
            None
        } else {
            Some(Evidence {
                context_item_id: e.context_item_id.trim().to_string(),
                snippet_line_range: e.snippet_line_range,
            })
        }
    });

    Some(Finding {
        finding_id: format!("finding_{next_ordinal}"),
        severity,
        category,
        title,
        message,
        suggested_fix,
        file_path,
        hunk_id: raw.hunk_id.filter(|h| !h.trim().is_empty()),
        line_hint: raw.line_hint,
        confidence: raw.confidence.clamp(0.0, 1.0),
        evidence,
        related_symbols: raw.related_symbols,
        code_examples: clip(raw.code_examples, MAX_CODE_EXAMPLES),
    })
}

fn clip(mut values: Vec<String>, cap: usize) -> Vec<String> {
    values.truncate(cap);
    values
}

/// Re-check the invariants downstream stages rely on.
///
/// Returns violation descriptions; empty means valid. Used to build the
/// compact error digest for reprompts.
pub fn validate(output: &ReviewOutput) -> Vec<String> {
    let mut violations = Vec::new();

    if output.findings.len() > MAX_FINDINGS_SCHEMA {
        violations.push(format!(
            "findings count {} exceeds {MAX_FINDINGS_SCHEMA}",
            output.findings.len()
        ));
    }

    for (index, finding) in output.findings.iter().enumerate() {
        let expected = format!("finding_{}", index + 1);
        if finding.finding_id != expected {
            violations.push(format!(
                "finding id {:?} at position {} should be {:?}",
                finding.finding_id,
                index + 1,
                expected
            ));
        }
        if !(0.0..=1.0).contains(&finding.confidence) {
            violations.push(format!("{} confidence out of range", finding.finding_id));
        }
    }

    if output.total_findings != output.findings.len() {
        violations.push(format!(
            "total_findings {} does not match findings count {}",
            output.total_findings,
            output.findings.len()
        ));
    }

    let high = output.findings.iter().filter(|f| f.is_high_confidence()).count();
    if output.high_confidence_findings != high {
        violations.push(format!(
            "high_confidence_findings {} does not match actual count {high}",
            output.high_confidence_findings
        ));
    }

    if output.summary.trim().chars().count() < MIN_SUMMARY_CHARS {
        violations.push("summary shorter than 20 characters".to_string());
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_finding_json(id_suffix: &str) -> serde_json::Value {
        serde_json::json!({
            "finding_id": format!("finding_{id_suffix}"),
            "severity": "high",
            "category": "bug",
            "title": "Possible panic on empty input",
            "message": "The slice index is unchecked and panics on empty input.",
            "suggested_fix": "Guard the indexing with a length check before use.",
            "file_path": "src/lib.rs",
            "confidence": 0.8
        })
    }

    #[test]
    fn test_extract_json_plain() {
        let value = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_extract_json_fenced() {
        let content = "Here is the review:\n```json\n{\"findings\": []}\n```\nDone.";
        let value = extract_json(content).unwrap();
        assert!(value["findings"].is_array());
    }

    #[test]
    fn test_extract_json_embedded_in_prose() {
        let content = "Sure! {\"summary\": \"ok\"} hope that helps";
        let value = extract_json(content).unwrap();
        assert_eq!(value["summary"], "ok");
    }

    #[test]
    fn test_extract_json_failure() {
        assert!(extract_json("no json here at all").is_err());
    }

    #[test]
    fn test_normalize_renumbers_non_sequential_ids() {
        // Input labelled finding_3 and finding_7 comes out as finding_1, finding_2
        let value = serde_json::json!({
            "findings": [raw_finding_json("3"), raw_finding_json("7")],
            "summary": "Two findings worth a careful look before merging.",
            "total_findings": 99,
            "high_confidence_findings": 0
        });
        let (output, _) = normalize(value, 12).unwrap();

        assert_eq!(output.findings.len(), 2);
        assert_eq!(output.findings[0].finding_id, "finding_1");
        assert_eq!(output.findings[1].finding_id, "finding_2");
        assert_eq!(output.total_findings, 2);
        assert_eq!(output.high_confidence_findings, 2);
        assert!(validate(&output).is_empty());
    }

    #[test]
    fn test_normalize_coerces_aliases_with_warnings() {
        let mut finding = raw_finding_json("1");
        finding["severity"] = "critical".into();
        finding["category"] = "documentation".into();
        let value = serde_json::json!({
            "findings": [finding],
            "summary": "Alias coercion keeps the canonical enums intact."
        });
        let (output, warnings) = normalize(value, 12).unwrap();

        assert_eq!(output.findings[0].severity, Severity::Blocker);
        assert_eq!(output.findings[0].category, Category::Docs);
        assert!(warnings.is_empty());

        let mut odd = raw_finding_json("1");
        odd["severity"] = "catastrophic".into();
        odd["category"] = "vibes".into();
        let value = serde_json::json!({
            "findings": [odd],
            "summary": "Unknown aliases fall back with a warning recorded."
        });
        let (output, warnings) = normalize(value, 12).unwrap();
        assert_eq!(output.findings[0].severity, Severity::Medium);
        assert_eq!(output.findings[0].category, Category::Maintainability);
        assert!(warnings.iter().any(|w| w.starts_with("severity_alias_unknown")));
        assert!(warnings.iter().any(|w| w.starts_with("category_alias_unknown")));
    }

    #[test]
    fn test_normalize_drops_malformed_findings() {
        let mut short = raw_finding_json("1");
        short["message"] = "tiny".into();
        let value = serde_json::json!({
            "findings": [short, raw_finding_json("2")],
            "summary": "One finding survives, one is dropped for brevity."
        });
        let (output, warnings) = normalize(value, 12).unwrap();

        assert_eq!(output.findings.len(), 1);
        assert_eq!(output.findings[0].finding_id, "finding_1");
        assert!(warnings.contains(&"finding_dropped:short_message".to_string()));
    }

    #[test]
    fn test_normalize_clips_arrays() {
        let mut finding = raw_finding_json("1");
        finding["code_examples"] = serde_json::json!(["a", "b", "c", "d", "e"]);
        let value = serde_json::json!({
            "findings": [finding],
            "summary": "Array fields are clipped to their schema maxima.",
            "patterns": ["p1", "p2", "p3", "p4", "p5", "p6", "p7"],
            "recommendations": ["r1", "r2", "r3", "r4"]
        });
        let (output, _) = normalize(value, 12).unwrap();

        assert_eq!(output.findings[0].code_examples.len(), 3);
        assert_eq!(output.patterns.len(), 5);
        assert_eq!(output.recommendations.len(), 3);
    }

    #[test]
    fn test_normalize_rejects_short_summary() {
        let value = serde_json::json!({
            "findings": [],
            "summary": "too short"
        });
        let err = normalize(value, 12).unwrap_err();
        assert_eq!(err.code(), "llm_schema_failure");
    }

    #[test]
    fn test_normalize_enforces_findings_cap() {
        let findings: Vec<serde_json::Value> =
            (0..30).map(|_| raw_finding_json("1")).collect();
        let value = serde_json::json!({
            "findings": findings,
            "summary": "More findings than the schema allows are clipped."
        });
        let (output, warnings) = normalize(value, 50).unwrap();

        // max_findings is itself capped at the schema maximum of 20
        assert_eq!(output.findings.len(), MAX_FINDINGS_SCHEMA);
        assert!(warnings.iter().any(|w| w.starts_with("findings_clipped")));
    }

    #[test]
    fn test_validate_catches_bad_counts() {
        let value = serde_json::json!({
            "findings": [raw_finding_json("1")],
            "summary": "A single finding with consistent counters."
        });
        let (mut output, _) = normalize(value, 12).unwrap();
        output.total_findings = 5;
        let violations = validate(&output);
        assert!(violations.iter().any(|v| v.contains("total_findings")));
    }

    #[test]
    fn test_file_path_normalized() {
        let mut finding = raw_finding_json("1");
        finding["file_path"] = "/src\\deep/mod.rs".into();
        let value = serde_json::json!({
            "findings": [finding],
            "summary": "Paths are normalized to forward slashes, no leading slash."
        });
        let (output, _) = normalize(value, 12).unwrap();
        assert_eq!(output.findings[0].file_path, "src/deep/mod.rs");
    }
}
