//! Seed set extraction: the bounded set of symbols and files a PR touches.
//!
//! Every non-binary patch contributes a seed file. When the head clone is
//! available, changed lines are mapped to their innermost enclosing
//! definition via tree-sitter and contribute seed symbols. Without an AST
//! the file-level seed still stands.

mod ast;

pub use ast::{detect_language, AstAnalyzer, Definition};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::diff::{FilePatch, LineTag};
use crate::types::ChangeType;

/// Kind of a seed symbol definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Class,
    Function,
    Method,
    Struct,
    Enum,
    Interface,
    Module,
    Impl,
    Trait,
    Other,
}

impl std::fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymbolKind::Class => write!(f, "class"),
            SymbolKind::Function => write!(f, "function"),
            SymbolKind::Method => write!(f, "method"),
            SymbolKind::Struct => write!(f, "struct"),
            SymbolKind::Enum => write!(f, "enum"),
            SymbolKind::Interface => write!(f, "interface"),
            SymbolKind::Module => write!(f, "module"),
            SymbolKind::Impl => write!(f, "impl"),
            SymbolKind::Trait => write!(f, "trait"),
            SymbolKind::Other => write!(f, "other"),
        }
    }
}

/// A file touched by the PR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedFile {
    pub file_path: String,
    /// Why the file is a seed (its change type)
    pub reason: String,
}

/// A symbol whose definition encloses a changed line.
///
/// Carries both halves of the dual-id scheme: `version_id` is snapshot
/// scoped and changes on any move or span change; `stable_id` survives
/// renames and moves. The two are never collapsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedSymbol {
    pub file_path: String,
    pub name: String,
    pub qualified_name: Option<String>,
    pub kind: SymbolKind,
    /// AST structure fingerprint, when an AST was available
    pub fingerprint: Option<String>,
    pub start_line: u32,
    pub end_line: u32,
}

impl SeedSymbol {
    /// At least one of `qualified_name` or `name` must be non-empty.
    pub fn has_identifier(&self) -> bool {
        !self.name.trim().is_empty()
            || self.qualified_name.as_deref().is_some_and(|q| !q.trim().is_empty())
    }

    /// Snapshot-scoped id: hash of (commit_sha, path, kind, ident, span).
    pub fn version_id(&self, commit_sha: &str) -> String {
        let ident = self.qualified_name.as_deref().unwrap_or(&self.name);
        let input = format!(
            "{}:{}:{}:{}:{}:{}",
            commit_sha, self.file_path, self.kind, ident, self.start_line, self.end_line
        );
        short_hash(&input)
    }

    /// Repo-scoped id: hash of (repo_id, kind, fingerprint | qualified | name).
    pub fn stable_id(&self, repo_id: Uuid) -> String {
        let ident = self
            .fingerprint
            .as_deref()
            .or(self.qualified_name.as_deref())
            .unwrap_or(&self.name);
        let input = format!("{}:{}:{}", repo_id, self.kind, ident);
        short_hash(&input)
    }
}

fn short_hash(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..8])
}

/// The bounded seed set produced from a parsed diff.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedSet {
    pub symbols: Vec<SeedSymbol>,
    pub files: Vec<SeedFile>,
    pub warnings: Vec<String>,
}

impl SeedSet {
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty() && self.files.is_empty()
    }

    /// Unique file paths across files and symbols.
    pub fn unique_file_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .files
            .iter()
            .map(|f| f.file_path.clone())
            .chain(self.symbols.iter().map(|s| s.file_path.clone()))
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

/// Extract the seed set from parsed patches.
///
/// `clone_root` points at the head checkout; when absent, no symbol seeds
/// are emitted. Caps are applied after extraction in deterministic order
/// (file path ascending, then start line ascending) with a `seed_truncated`
/// warning on overflow.
pub fn extract_seed_set(
    patches: &[FilePatch],
    clone_root: Option<&Path>,
    limits: &LimitsConfig,
) -> SeedSet {
    let mut set = SeedSet::default();
    let mut analyzer = match clone_root {
        Some(_) => match AstAnalyzer::new() {
            Ok(a) => Some(a),
            Err(e) => {
                debug!("AST analyzer unavailable: {e}");
                set.warnings.push("ast_unavailable".to_string());
                None
            }
        },
        None => None,
    };

    let mut seen_symbols: HashSet<(String, String, String)> = HashSet::new();

    for patch in patches {
        if patch.is_binary {
            continue;
        }

        set.files.push(SeedFile {
            file_path: patch.file_path.clone(),
            reason: patch.change_type.to_string(),
        });

        if patch.change_type == ChangeType::Deleted || patch.hunks.is_empty() {
            continue;
        }

        let (Some(root), Some(analyzer)) = (clone_root, analyzer.as_mut()) else {
            continue;
        };

        let Ok(content) = std::fs::read_to_string(root.join(&patch.file_path)) else {
            debug!("could not read {} from clone", patch.file_path);
            continue;
        };

        let definitions = analyzer.definitions(&patch.file_path, &content);
        if definitions.is_empty() {
            continue;
        }

        for hunk in &patch.hunks {
            for idx in hunk.added_line_indexes() {
                debug_assert_eq!(hunk.lines[idx].tag, LineTag::Addition);
                let line = hunk.absolute_new_line(idx);
                let Some(def) = innermost_enclosing(&definitions, line) else {
                    continue;
                };
                let ident = def
                    .qualified_name
                    .clone()
                    .unwrap_or_else(|| def.name.clone());
                let key = (patch.file_path.clone(), ident, def.kind.to_string());
                if !seen_symbols.insert(key) {
                    continue;
                }
                set.symbols.push(SeedSymbol {
                    file_path: patch.file_path.clone(),
                    name: def.name.clone(),
                    qualified_name: def.qualified_name.clone(),
                    kind: def.kind,
                    fingerprint: Some(def.fingerprint.clone()),
                    start_line: def.start_line,
                    end_line: def.end_line,
                });
            }
        }
    }

    // Deterministic order before applying caps
    set.symbols
        .sort_by(|a, b| a.file_path.cmp(&b.file_path).then(a.start_line.cmp(&b.start_line)));
    set.files.sort_by(|a, b| a.file_path.cmp(&b.file_path));

    if set.symbols.len() > limits.max_seed_symbols {
        set.symbols.truncate(limits.max_seed_symbols);
        set.warnings.push("seed_truncated".to_string());
    }
    if set.files.len() > limits.max_seed_files {
        set.files.truncate(limits.max_seed_files);
        if !set.warnings.contains(&"seed_truncated".to_string()) {
            set.warnings.push("seed_truncated".to_string());
        }
    }

    set
}

/// The smallest definition whose span contains the line.
fn innermost_enclosing<'a>(definitions: &'a [Definition], line: u32) -> Option<&'a Definition> {
    definitions
        .iter()
        .filter(|d| d.contains_line(line))
        .min_by_key(|d| d.span())
}
