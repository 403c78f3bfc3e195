//! Review publication: absolute line computation and submission.
//!
//! Anchored findings become inline comments with absolute new-file line
//! numbers computed from their hunk position; unanchored findings ride
//! along in the review body. Publication is at-most-once per run — a
//! failed POST is recorded, never retried with the same content.

use tracing::{info, warn};

use crate::diff::DiffMappings;
use crate::github::{GithubClient, ReviewComment, ReviewSubmission};
use crate::review::{AnchorOutcome, AnchoredFinding, ReviewOutput};

/// Outcome of the publish stage; failures are data, not errors.
#[derive(Debug, Clone, Default)]
pub struct PublishResult {
    pub published: bool,
    pub github_review_id: Option<i64>,
    pub comment_count: usize,
    pub error: Option<String>,
    pub skipped_dry_run: bool,
}

/// Compute the absolute new-file line for an anchored finding.
///
/// Counts context and addition lines before `line_in_hunk`; deletions do
/// not advance the counter. Index 0 maps to the hunk's `new_start`.
pub fn absolute_line(mappings: &DiffMappings, finding: &AnchoredFinding) -> Option<u32> {
    let hunk = mappings.hunk(&finding.finding.file_path, &finding.hunk_id)?;
    Some(hunk.absolute_new_line(finding.line_in_hunk))
}

/// Build the single review submission for a run.
pub fn build_submission(
    output: &ReviewOutput,
    outcome: &AnchorOutcome,
    mappings: &DiffMappings,
) -> ReviewSubmission {
    let mut comments = Vec::with_capacity(outcome.anchored.len());
    for anchored in &outcome.anchored {
        let Some(line) = absolute_line(mappings, anchored) else {
            warn!(
                "anchored finding {} lost its hunk, demoting to summary",
                anchored.finding.finding_id
            );
            continue;
        };
        comments.push(ReviewComment {
            path: anchored.finding.file_path.clone(),
            line,
            side: "RIGHT",
            body: comment_body(anchored),
        });
    }

    ReviewSubmission {
        body: review_body(output, outcome),
        event: "COMMENT",
        comments,
    }
}

fn comment_body(anchored: &AnchoredFinding) -> String {
    let finding = &anchored.finding;
    let mut body = format!(
        "**[{}/{}]** {}\n\n{}",
        finding.severity, finding.category, finding.title, finding.message
    );
    if !finding.suggested_fix.is_empty() {
        body.push_str(&format!("\n\n**Suggested fix:** {}", finding.suggested_fix));
    }
    body
}

fn review_body(output: &ReviewOutput, outcome: &AnchorOutcome) -> String {
    let mut body = output.summary.clone();

    if !outcome.unanchored.is_empty() {
        body.push_str("\n\n---\n\n**Additional findings (no inline position):**\n");
        for finding in &outcome.unanchored {
            body.push_str(&format!(
                "\n- **[{}]** `{}`: {} — {}",
                finding.severity, finding.file_path, finding.title, finding.message
            ));
        }
    }

    if !output.recommendations.is_empty() {
        body.push_str("\n\n**Recommendations:**\n");
        for recommendation in &output.recommendations {
            body.push_str(&format!("\n- {recommendation}"));
        }
    }

    body
}

/// Submits the review, splitting the comment batch when the host rejects
/// it by size.
pub struct Publisher<'a> {
    github: &'a GithubClient,
    dry_run: bool,
}

impl<'a> Publisher<'a> {
    pub fn new(github: &'a GithubClient, dry_run: bool) -> Self {
        Self { github, dry_run }
    }

    /// Publish one review; never propagates errors upward.
    pub async fn publish(
        &self,
        owner_repo: &str,
        pr_number: u64,
        submission: ReviewSubmission,
    ) -> PublishResult {
        let comment_count = submission.comments.len();

        if self.dry_run {
            info!("dry run: skipping publish of {comment_count} comments");
            return PublishResult {
                published: false,
                github_review_id: None,
                comment_count,
                error: None,
                skipped_dry_run: true,
            };
        }

        match self.submit_with_split(owner_repo, pr_number, submission, 0).await {
            Ok(review_id) => PublishResult {
                published: true,
                github_review_id: Some(review_id),
                comment_count,
                error: None,
                skipped_dry_run: false,
            },
            Err(message) => {
                warn!("publish failed for {owner_repo}#{pr_number}: {message}");
                PublishResult {
                    published: false,
                    github_review_id: None,
                    comment_count,
                    error: Some(message),
                    skipped_dry_run: false,
                }
            }
        }
    }

    /// Submit, halving the comment batch on size rejections.
    async fn submit_with_split(
        &self,
        owner_repo: &str,
        pr_number: u64,
        submission: ReviewSubmission,
        depth: u32,
    ) -> std::result::Result<i64, String> {
        match self.github.create_review(owner_repo, pr_number, &submission).await {
            Ok(review_id) => Ok(review_id),
            Err(e) if is_size_rejection(&e) && submission.comments.len() > 1 && depth < 4 => {
                warn!(
                    "review batch of {} comments rejected by size, splitting",
                    submission.comments.len()
                );
                let mid = submission.comments.len() / 2;
                let mut first_half = submission.comments;
                let second_half = first_half.split_off(mid);

                let first = ReviewSubmission {
                    body: submission.body.clone(),
                    event: submission.event,
                    comments: first_half,
                };
                let second = ReviewSubmission {
                    body: "(continued review comments)".to_string(),
                    event: submission.event,
                    comments: second_half,
                };

                let first_id =
                    Box::pin(self.submit_with_split(owner_repo, pr_number, first, depth + 1))
                        .await?;
                Box::pin(self.submit_with_split(owner_repo, pr_number, second, depth + 1)).await?;
                Ok(first_id)
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

fn is_size_rejection(error: &crate::error::ReviewError) -> bool {
    matches!(
        error,
        crate::error::ReviewError::GitHubApi { status: 413 | 422, .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{parse_patch, FilePatch};
    use crate::review::{anchor_findings, Finding};
    use crate::types::{Category, ChangeType, Severity};

    fn mappings() -> DiffMappings {
        let patch = FilePatch {
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
        };
        DiffMappings::build(&[patch])
    }

    fn finding(file: &str) -> Finding {
        Finding {
            finding_id: "finding_1".to_string(),
            severity: Severity::High,
            category: Category::Bug,
            title: "Dropped error".to_string(),
            message: "The new code swallows the failure case.".to_string(),
            suggested_fix: "Return the error instead of a bare result.".to_string(),
            file_path: file.to_string(),
            hunk_id: Some("hunk_1".to_string()),
            line_hint: Some(2),
            confidence: 0.8,
            evidence: None,
            related_symbols: vec![],
            code_examples: vec![],
        }
    }

    fn sample_output() -> ReviewOutput {
        ReviewOutput {
            findings: vec![finding("src/test.py")],
            summary: "One correctness issue found in the changed function.".to_string(),
            patterns: vec![],
            recommendations: vec!["Add a regression test for the falsy path.".to_string()],
            total_findings: 1,
            high_confidence_findings: 1,
            review_timestamp: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_absolute_line_matches_walk_rule() {
        let mappings = mappings();
        let output = sample_output();
        let outcome = anchor_findings(&output.findings, &mappings, &Default::default());
        let anchored = &outcome.anchored[0];

        // line_in_hunk 2 (first addition): one context line counted,
        // deletion skipped -> new_start 1 + 1 = 2
        assert_eq!(anchored.line_in_hunk, 2);
        assert_eq!(absolute_line(&mappings, anchored), Some(2));
    }

    #[test]
    fn test_submission_carries_right_side_comments() {
        let mappings = mappings();
        let output = sample_output();
        let outcome = anchor_findings(&output.findings, &mappings, &Default::default());
        let submission = build_submission(&output, &outcome, &mappings);

        assert_eq!(submission.event, "COMMENT");
        assert_eq!(submission.comments.len(), 1);
        assert_eq!(submission.comments[0].side, "RIGHT");
        assert_eq!(submission.comments[0].line, 2);
        assert!(submission.comments[0].body.contains("Dropped error"));
        assert!(submission.comments[0].body.contains("Suggested fix"));
    }

    #[test]
    fn test_unanchored_findings_land_in_body() {
        let mappings = mappings();
        let mut output = sample_output();
        output.findings.push(Finding {
            finding_id: "finding_2".to_string(),
            file_path: "not_in_diff.py".to_string(),
            ..finding("not_in_diff.py")
        });
        output.total_findings = 2;

        let outcome = anchor_findings(&output.findings, &mappings, &Default::default());
        let submission = build_submission(&output, &outcome, &mappings);

        assert_eq!(submission.comments.len(), 1);
        assert!(submission.body.contains("Additional findings"));
        assert!(submission.body.contains("not_in_diff.py"));
    }

    #[test]
    fn test_body_includes_recommendations() {
        let mappings = mappings();
        let output = sample_output();
        let outcome = anchor_findings(&output.findings, &mappings, &Default::default());
        let submission = build_submission(&output, &outcome, &mappings);
        assert!(submission.body.contains("regression test"));
    }
}
