//! Unified-diff parsing for PR file entries.
//!
//! Consumes the patch text the code-host API attaches to each changed file
//! and produces the hunk model. A malformed patch fails only its own file;
//! the pipeline continues with the remaining files.

use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

use crate::error::{ReviewError, Result};
use crate::types::ChangeType;

use super::{normalize_path, DiffLine, FilePatch, Hunk, LineTag};

/// A changed-file entry as reported by the code host, before parsing.
#[derive(Debug, Clone)]
pub struct RawFileChange {
    pub path: String,
    pub previous_path: Option<String>,
    pub change_type: ChangeType,
    pub additions: u32,
    pub deletions: u32,
    pub changes: u32,
    /// Unified-diff body; absent for binary files and some pure renames
    pub patch: Option<String>,
}

fn hunk_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap()
    })
}

/// Parse a unified-diff patch body into hunks.
///
/// Hunk ids are ordinal within the file (`hunk_1`, `hunk_2`, ...). Count
/// fields default to 1 when the header omits them. Body lines are
/// classified by first byte; a line that fits no class is a format error.
pub fn parse_patch(file_path: &str, patch: &str) -> Result<Vec<Hunk>> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;

    for line in patch.lines() {
        if let Some(caps) = hunk_header_re().captures(line) {
            if let Some(hunk) = current.take() {
                validate_hunk(file_path, &hunk)?;
                hunks.push(hunk);
            }
            let ordinal = hunks.len() + 1;
            current = Some(Hunk {
                hunk_id: format!("hunk_{ordinal}"),
                old_start: parse_header_num(file_path, &caps, 1)?,
                old_count: parse_header_count(&caps, 2),
                new_start: parse_header_num(file_path, &caps, 3)?,
                new_count: parse_header_count(&caps, 4),
                lines: Vec::new(),
            });
            continue;
        }

        let Some(hunk) = current.as_mut() else {
            return Err(ReviewError::InvalidDiffFormat {
                file_path: file_path.to_string(),
                message: format!("content before first hunk header: {line:?}"),
            });
        };

        let (tag, text) = match line.as_bytes().first() {
            Some(b' ') => (LineTag::Context, &line[1..]),
            Some(b'+') => (LineTag::Addition, &line[1..]),
            Some(b'-') => (LineTag::Deletion, &line[1..]),
            Some(b'\\') => (LineTag::NoEol, line),
            // GitHub omits the leading space on empty context lines
            None => (LineTag::Context, line),
            Some(_) => {
                return Err(ReviewError::InvalidDiffFormat {
                    file_path: file_path.to_string(),
                    message: format!("unclassifiable diff line: {line:?}"),
                });
            }
        };
        hunk.lines.push(DiffLine { tag, text: text.to_string() });
    }

    if let Some(hunk) = current.take() {
        validate_hunk(file_path, &hunk)?;
        hunks.push(hunk);
    }

    Ok(hunks)
}

fn parse_header_num(file_path: &str, caps: &regex::Captures<'_>, idx: usize) -> Result<u32> {
    caps.get(idx)
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| ReviewError::InvalidDiffFormat {
            file_path: file_path.to_string(),
            message: "unparseable hunk header".to_string(),
        })
}

fn parse_header_count(caps: &regex::Captures<'_>, idx: usize) -> u32 {
    caps.get(idx).and_then(|m| m.as_str().parse().ok()).unwrap_or(1)
}

/// Cross-check body line counts against the header.
///
/// A body may fall short of the header (hosts truncate trailing context in
/// patch previews) but can never exceed it.
fn validate_hunk(file_path: &str, hunk: &Hunk) -> Result<()> {
    let old_lines = hunk
        .lines
        .iter()
        .filter(|l| matches!(l.tag, LineTag::Context | LineTag::Deletion))
        .count() as u32;
    let new_lines = hunk
        .lines
        .iter()
        .filter(|l| matches!(l.tag, LineTag::Context | LineTag::Addition))
        .count() as u32;

    if old_lines > hunk.old_count || new_lines > hunk.new_count {
        return Err(ReviewError::InvalidDiffFormat {
            file_path: file_path.to_string(),
            message: format!(
                "hunk {} body/header mismatch: header -{},{} +{},{}, body old={} new={}",
                hunk.hunk_id,
                hunk.old_start,
                hunk.old_count,
                hunk.new_start,
                hunk.new_count,
                old_lines,
                new_lines
            ),
        });
    }
    Ok(())
}

/// Build `FilePatch` records from raw file entries.
///
/// Binary files and pure renames keep empty hunks; a file whose patch fails
/// to parse is skipped with a warning and its path returned in the second
/// element so the caller can surface it.
pub fn patches_from_changes(changes: &[RawFileChange]) -> (Vec<FilePatch>, Vec<String>) {
    let mut patches = Vec::with_capacity(changes.len());
    let mut skipped = Vec::new();

    for change in changes {
        let file_path = normalize_path(&change.path);
        let is_binary = change.patch.is_none() && change.change_type != ChangeType::Renamed;

        let hunks = match &change.patch {
            Some(patch) if !patch.is_empty() => match parse_patch(&file_path, patch) {
                Ok(hunks) => hunks,
                Err(e) => {
                    warn!("skipping {file_path}: {e}");
                    skipped.push(file_path);
                    continue;
                }
            },
            _ => Vec::new(),
        };

        patches.push(FilePatch {
            file_path,
            change_type: change.change_type,
            previous_path: change.previous_path.as_deref().map(normalize_path),
            additions: change.additions,
            deletions: change.deletions,
            changes: change.changes,
            hunks,
            is_binary,
        });
    }

    (patches, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE_PATCH: &str = "@@ -1,3 +1,6 @@\n def test():\n-    return False\n+    # Updated\n+    result = calculate()\n+    return result";

    #[test]
    fn test_parse_single_hunk() {
        let hunks = parse_patch("src/test.py", SAMPLE_PATCH).unwrap();
        assert_eq!(hunks.len(), 1);
        let hunk = &hunks[0];
        assert_eq!(hunk.hunk_id, "hunk_1");
        assert_eq!(hunk.old_start, 1);
        assert_eq!(hunk.old_count, 3);
        assert_eq!(hunk.new_start, 1);
        assert_eq!(hunk.new_count, 6);
        assert_eq!(hunk.added_line_indexes(), vec![2, 3, 4]);
    }

    #[test]
    fn test_parse_defaults_count_to_one() {
        let patch = "@@ -5 +5 @@\n-old\n+new";
        let hunks = parse_patch("a.rs", patch).unwrap();
        assert_eq!(hunks[0].old_count, 1);
        assert_eq!(hunks[0].new_count, 1);
    }

    #[test]
    fn test_parse_noeol_marker() {
        let patch = "@@ -1 +1 @@\n-old\n+new\n\\ No newline at end of file";
        let hunks = parse_patch("a.rs", patch).unwrap();
        assert_eq!(hunks[0].lines.len(), 3);
        assert_eq!(hunks[0].lines[2].tag, LineTag::NoEol);
        // The marker does not count toward either side
        assert_eq!(hunks[0].added_line_indexes(), vec![1]);
    }

    #[test]
    fn test_parse_multiple_hunks() {
        let patch = "@@ -1,2 +1,2 @@\n ctx\n-a\n+b\n@@ -10,1 +10,2 @@\n ctx\n+c";
        let hunks = parse_patch("a.rs", patch).unwrap();
        assert_eq!(hunks.len(), 2);
        assert_eq!(hunks[0].hunk_id, "hunk_1");
        assert_eq!(hunks[1].hunk_id, "hunk_2");
        assert_eq!(hunks[1].new_start, 10);
    }

    #[test]
    fn test_body_exceeding_header_rejected() {
        let patch = "@@ -1,1 +1,1 @@\n ctx\n ctx2\n-a\n+b";
        let err = parse_patch("a.rs", patch).unwrap_err();
        assert_eq!(err.code(), "invalid_diff_format");
    }

    #[test]
    fn test_truncated_body_accepted() {
        // Hosts may truncate trailing context in patch previews
        let patch = "@@ -1,5 +1,5 @@\n ctx\n-a\n+b";
        assert!(parse_patch("a.rs", patch).is_ok());
    }

    #[test]
    fn test_content_before_header_rejected() {
        let err = parse_patch("a.rs", "garbage\n@@ -1 +1 @@\n-a\n+b").unwrap_err();
        assert_eq!(err.code(), "invalid_diff_format");
    }

    #[test]
    fn test_empty_context_line_without_space() {
        // GitHub trims the leading space on blank context lines
        let patch = "@@ -1,3 +1,3 @@\n a\n\n-b\n+c";
        let hunks = parse_patch("a.rs", patch).unwrap();
        assert_eq!(hunks[0].lines[1].tag, LineTag::Context);
        assert_eq!(hunks[0].lines[1].text, "");
    }

    #[test]
    fn test_patches_from_changes_binary() {
        let changes = vec![RawFileChange {
            path: "logo.png".to_string(),
            previous_path: None,
            change_type: ChangeType::Modified,
            additions: 0,
            deletions: 0,
            changes: 0,
            patch: None,
        }];
        let (patches, skipped) = patches_from_changes(&changes);
        assert!(skipped.is_empty());
        assert!(patches[0].is_binary);
        assert!(patches[0].hunks.is_empty());
        assert!(!patches[0].is_parseable());
    }

    #[test]
    fn test_patches_from_changes_pure_rename() {
        let changes = vec![RawFileChange {
            path: "src/new_name.rs".to_string(),
            previous_path: Some("src/old_name.rs".to_string()),
            change_type: ChangeType::Renamed,
            additions: 0,
            deletions: 0,
            changes: 0,
            patch: None,
        }];
        let (patches, _) = patches_from_changes(&changes);
        assert!(!patches[0].is_binary);
        assert!(patches[0].hunks.is_empty());
        assert_eq!(patches[0].previous_path.as_deref(), Some("src/old_name.rs"));
    }

    #[test]
    fn test_patches_from_changes_skips_malformed() {
        let changes = vec![
            RawFileChange {
                path: "bad.rs".to_string(),
                previous_path: None,
                change_type: ChangeType::Modified,
                additions: 1,
                deletions: 0,
                changes: 1,
                patch: Some("@@ -1,9 +1,9 @@\n+only".to_string()),
            },
            RawFileChange {
                path: "good.rs".to_string(),
                previous_path: None,
                change_type: ChangeType::Modified,
                additions: 1,
                deletions: 1,
                changes: 2,
                patch: Some("@@ -1 +1 @@\n-a\n+b".to_string()),
            },
        ];
        let (patches, skipped) = patches_from_changes(&changes);
        assert_eq!(skipped, vec!["bad.rs"]);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].file_path, "good.rs");
    }

    proptest! {
        /// Walking lines with "context+addition increment, deletion skip"
        /// reproduces new_start + new_count - 1 at the last non-deletion line.
        #[test]
        fn prop_new_line_walk_matches_header(
            new_start in 1u32..500,
            body in proptest::collection::vec(0u8..3, 1..40),
        ) {
            // Build a synthetic but internally consistent hunk
            let mut lines = String::new();
            let mut old_count = 0u32;
            let mut new_count = 0u32;
            for tag in &body {
                match tag {
                    0 => { lines.push_str(" ctx\n"); old_count += 1; new_count += 1; }
                    1 => { lines.push_str("+add\n"); new_count += 1; }
                    _ => { lines.push_str("-del\n"); old_count += 1; }
                }
            }
            prop_assume!(new_count > 0);
            let patch = format!("@@ -1,{old_count} +{new_start},{new_count} @@\n{lines}");
            let hunks = parse_patch("p.rs", &patch).unwrap();
            let hunk = &hunks[0];

            let mut line_no = hunk.new_start;
            let mut last_non_deletion = None;
            for line in &hunk.lines {
                match line.tag {
                    LineTag::Context | LineTag::Addition => {
                        last_non_deletion = Some(line_no);
                        line_no += 1;
                    }
                    LineTag::Deletion | LineTag::NoEol => {}
                }
            }
            prop_assert_eq!(last_non_deletion, Some(hunk.new_start + hunk.new_count - 1));
        }
    }
}
