mod mappings;
mod parser;

pub use mappings::{DiffMappings, MappingStats};
pub use parser::{parse_patch, patches_from_changes, RawFileChange};

use serde::{Deserialize, Serialize};

use crate::types::ChangeType;

/// Classification of a single line inside a hunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineTag {
    Context,
    Addition,
    Deletion,
    /// `\ No newline at end of file` marker; refers to the previous line
    NoEol,
}

/// One tagged line of a hunk body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub tag: LineTag,
    pub text: String,
}

/// A contiguous change region within a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    /// Ordinal-based id, stable within its file (`hunk_1`, `hunk_2`, ...).
    /// Anchors are always the `(file_path, hunk_id)` pair.
    pub hunk_id: String,
    pub old_start: u32,
    pub old_count: u32,
    pub new_start: u32,
    pub new_count: u32,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    /// 0-based indexes into `lines` whose tag is `Addition`.
    pub fn added_line_indexes(&self) -> Vec<usize> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.tag == LineTag::Addition)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Absolute new-file line number for a 0-based index into `lines`.
    ///
    /// Counts context and addition lines before the index; deletion and
    /// no-eol markers do not advance the new-file counter. Index 0 maps to
    /// `new_start` with no lines counted yet.
    pub fn absolute_new_line(&self, line_in_hunk: usize) -> u32 {
        let counted = self.lines[..line_in_hunk.min(self.lines.len())]
            .iter()
            .filter(|l| matches!(l.tag, LineTag::Context | LineTag::Addition))
            .count() as u32;
        self.new_start + counted
    }
}

/// A parsed file entry of the PR diff.
///
/// `hunks` is non-empty iff the file is neither binary nor a pure rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePatch {
    /// Normalized path: forward slashes, no leading `/`
    pub file_path: String,
    pub change_type: ChangeType,
    /// Original path, present only for renames
    pub previous_path: Option<String>,
    pub additions: u32,
    pub deletions: u32,
    pub changes: u32,
    pub hunks: Vec<Hunk>,
    pub is_binary: bool,
}

impl FilePatch {
    /// Whether this file carries parseable content for downstream stages.
    pub fn is_parseable(&self) -> bool {
        !self.is_binary && !self.hunks.is_empty()
    }
}

/// Normalize a repository-relative path: forward slashes, no leading `/` or `./`.
pub fn normalize_path(path: &str) -> String {
    let p = path.replace('\\', "/");
    let p = p.trim_start_matches('/');
    p.strip_prefix("./").unwrap_or(p).to_string()
}
