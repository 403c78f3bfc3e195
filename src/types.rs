use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReviewError, Result};

/// Input contract for a single review pipeline run.
///
/// Built once per run and treated as read-only by every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    /// GitHub App installation id
    pub installation_id: i64,
    /// Internal repository id (matches the KG's repo_id property)
    pub repo_id: Uuid,
    /// GitHub repository id
    pub github_repo_id: i64,
    /// Repository name in `owner/repo` form
    pub github_repo_name: String,
    pub pr_number: u64,
    /// PR head commit SHA (40-char lowercase hex)
    pub head_sha: String,
    /// PR base commit SHA (40-char lowercase hex)
    pub base_sha: String,
}

impl ReviewRequest {
    /// Validate the request at pipeline entry.
    ///
    /// head_sha == base_sha is permitted (an empty PR short-circuits later),
    /// but malformed identifiers are rejected here.
    pub fn validate(&self) -> Result<()> {
        if self.installation_id <= 0 {
            return Err(ReviewError::InvalidInput {
                message: format!("installation_id must be positive, got {}", self.installation_id),
            });
        }
        if self.github_repo_id <= 0 {
            return Err(ReviewError::InvalidInput {
                message: format!("github_repo_id must be positive, got {}", self.github_repo_id),
            });
        }
        if self.pr_number == 0 {
            return Err(ReviewError::InvalidInput {
                message: "pr_number must be >= 1".to_string(),
            });
        }
        let parts: Vec<&str> = self.github_repo_name.split('/').collect();
        if parts.len() != 2 || parts.iter().any(|p| p.trim().is_empty()) {
            return Err(ReviewError::InvalidInput {
                message: format!(
                    "github_repo_name must be owner/repo, got {:?}",
                    self.github_repo_name
                ),
            });
        }
        validate_sha("head_sha", &self.head_sha)?;
        validate_sha("base_sha", &self.base_sha)?;
        Ok(())
    }

    /// The `owner` half of the repository name.
    pub fn owner(&self) -> &str {
        self.github_repo_name.split('/').next().unwrap_or_default()
    }

    /// The `repo` half of the repository name.
    pub fn repo(&self) -> &str {
        self.github_repo_name.split('/').nth(1).unwrap_or_default()
    }
}

fn validate_sha(field: &str, sha: &str) -> Result<()> {
    if sha.len() != 40 || !sha.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(ReviewError::InvalidInput {
            message: format!("{field} must be a 40-char lowercase hex SHA"),
        });
    }
    Ok(())
}

/// How a file changed in the PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Added => write!(f, "added"),
            ChangeType::Modified => write!(f, "modified"),
            ChangeType::Deleted => write!(f, "deleted"),
            ChangeType::Renamed => write!(f, "renamed"),
        }
    }
}

/// Severity of a review finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocker,
    High,
    Medium,
    Low,
    Nit,
}

impl Severity {
    /// Coerce a raw LLM value through the alias table.
    ///
    /// Returns `None` for values outside the alias table; callers record a
    /// warning and fall back to `Medium`.
    pub fn from_alias(raw: &str) -> Option<Severity> {
        match raw.trim().to_lowercase().as_str() {
            "blocker" | "critical" => Some(Severity::Blocker),
            "high" | "major" => Some(Severity::High),
            "medium" | "moderate" | "warning" => Some(Severity::Medium),
            "low" | "minor" => Some(Severity::Low),
            "nit" | "nitpick" | "suggestion" => Some(Severity::Nit),
            _ => None,
        }
    }

    /// Upper-case canonical form used by the persistent store.
    pub fn canonical(self) -> &'static str {
        match self {
            Severity::Blocker => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
            Severity::Nit => "NIT",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Blocker => write!(f, "blocker"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
            Severity::Nit => write!(f, "nit"),
        }
    }
}

/// Canonical upper-case severity for storage.
///
/// Known aliases map to their canonical form; anything else is upper-cased
/// as-is so unexpected values survive round trips.
pub fn canonical_severity(raw: &str) -> String {
    match Severity::from_alias(raw) {
        Some(sev) => sev.canonical().to_string(),
        None => raw.trim().to_uppercase(),
    }
}

/// Category of a review finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Bug,
    Security,
    Performance,
    Style,
    Design,
    Docs,
    Observability,
    Maintainability,
}

impl Category {
    /// Coerce a raw LLM value through the alias table.
    pub fn from_alias(raw: &str) -> Option<Category> {
        match raw.trim().to_lowercase().as_str() {
            "bug" | "logic" | "correctness" | "error-handling" | "error_handling" => {
                Some(Category::Bug)
            }
            "security" | "vulnerability" => Some(Category::Security),
            "performance" | "perf" => Some(Category::Performance),
            "style" | "formatting" => Some(Category::Style),
            "design" | "architecture" => Some(Category::Design),
            "docs" | "documentation" => Some(Category::Docs),
            "observability" | "logging" | "monitoring" => Some(Category::Observability),
            "maintainability" | "readability" | "complexity" => Some(Category::Maintainability),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Bug => write!(f, "bug"),
            Category::Security => write!(f, "security"),
            Category::Performance => write!(f, "performance"),
            Category::Style => write!(f, "style"),
            Category::Design => write!(f, "design"),
            Category::Docs => write!(f, "docs"),
            Category::Observability => write!(f, "observability"),
            Category::Maintainability => write!(f, "maintainability"),
        }
    }
}

/// Where a context item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Seed,
    KgNeighbor,
    Doc,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provenance::Seed => write!(f, "seed"),
            Provenance::KgNeighbor => write!(f, "kg_neighbor"),
            Provenance::Doc => write!(f, "doc"),
        }
    }
}

/// Relationship that produced a KG neighbor candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    Caller,
    Callee,
    Contains,
    Imports,
    ImportedBy,
}

impl std::fmt::Display for Relationship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Relationship::Caller => write!(f, "caller"),
            Relationship::Callee => write!(f, "callee"),
            Relationship::Contains => write!(f, "contains"),
            Relationship::Imports => write!(f, "imports"),
            Relationship::ImportedBy => write!(f, "imported_by"),
        }
    }
}

/// Class of a KG candidate in the flat candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateType {
    SymbolMatch,
    Neighbor,
    ImportNeighbor,
    Doc,
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateType::SymbolMatch => write!(f, "symbol_match"),
            CandidateType::Neighbor => write!(f, "neighbor"),
            CandidateType::ImportNeighbor => write!(f, "import_neighbor"),
            CandidateType::Doc => write!(f, "doc"),
        }
    }
}
