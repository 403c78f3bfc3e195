//! Error types for the review pipeline.
//!
//! The taxonomy separates fatal errors (input validation, publish identity)
//! from recoverable ones (dependency hiccups that degrade a bounded stage).
//! Local errors stay local; callers consult `recoverable()` before deciding
//! whether to degrade or abort.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, ReviewError>;

/// Typed errors raised by pipeline stages.
#[derive(Error, Debug)]
pub enum ReviewError {
    /// Malformed review request; rejected at entry.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// PR exceeds the changed-file limit; fails before any KG call.
    #[error("PR too large: {changed_files} changed files exceeds limit {limit}")]
    PrTooLarge { changed_files: usize, limit: usize },

    /// Every file in the PR is binary or unparseable.
    #[error("no parseable files in PR")]
    NoParseableFiles,

    /// A single file's patch text did not parse; the file is skipped.
    #[error("invalid diff format in {file_path}: {message}")]
    InvalidDiffFormat { file_path: String, message: String },

    /// PR does not exist or is not visible to the installation.
    #[error("pull request not found: {owner_repo}#{pr_number}")]
    GitHubPrNotFound { owner_repo: String, pr_number: u64 },

    /// Installation token rejected.
    #[error("GitHub authentication failed")]
    GitHubAuthentication,

    /// Token valid but lacks access.
    #[error("GitHub permission denied")]
    GitHubPermission,

    /// Rate limited; retry after the given delay.
    #[error("GitHub rate limit hit, retry after {retry_after_secs}s")]
    GitHubRateLimit { retry_after_secs: u64 },

    /// Any other non-2xx response from the code host.
    #[error("GitHub API error ({status}): {message}")]
    GitHubApi { status: u16, message: String },

    /// KG query exceeded its timeout.
    #[error("KG query timed out: {query}")]
    KgQueryTimeout { query: String },

    /// KG connection or query failure.
    #[error("KG unavailable: {message}")]
    KgUnavailable { message: String },

    /// Snippet extraction failed for one candidate; the item is dropped.
    #[error("snippet extraction failed for {file_path}: {reason}")]
    SnippetExtractionFailed { file_path: String, reason: String },

    /// LLM output did not validate against the finding schema after retries.
    #[error("LLM schema validation failed: {message}")]
    LlmSchemaFailure { message: String },

    /// Transport-level LLM failure.
    #[error("LLM request failed: {message}")]
    LlmRequest { message: String },

    /// Anchoring could not run; findings fall back to unanchored.
    #[error("anchoring degraded: {message}")]
    AnchoringDegraded { message: String },

    /// Review submission failed; the run still completes with published=false.
    #[error("publish failed: {message}")]
    PublishFailed { message: String },

    /// A circuit breaker rejected the call outright.
    #[error("circuit open for {dependency}, retry in {cool_down_ms}ms")]
    CircuitOpen { dependency: String, cool_down_ms: u64 },

    /// A node's overall deadline was breached.
    #[error("node {node} timed out after {elapsed_ms}ms")]
    NodeTimeout { node: String, elapsed_ms: u64 },

    /// Cancellation signal observed.
    #[error("pipeline cancelled")]
    Cancelled,

    /// Clone acquisition or cleanup failure.
    #[error("clone error: {message}")]
    Clone { message: String },

    /// Configuration load/validation failure.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Persistence failure.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Filesystem failure outside snippet extraction.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReviewError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ReviewError::InvalidInput { .. } => "invalid_input",
            ReviewError::PrTooLarge { .. } => "pr_too_large",
            ReviewError::NoParseableFiles => "no_parseable_files",
            ReviewError::InvalidDiffFormat { .. } => "invalid_diff_format",
            ReviewError::GitHubPrNotFound { .. } => "github_pr_not_found",
            ReviewError::GitHubAuthentication => "github_authentication",
            ReviewError::GitHubPermission => "github_permission",
            ReviewError::GitHubRateLimit { .. } => "github_rate_limit",
            ReviewError::GitHubApi { .. } => "github_api",
            ReviewError::KgQueryTimeout { .. } => "kg_query_timeout",
            ReviewError::KgUnavailable { .. } => "kg_unavailable",
            ReviewError::SnippetExtractionFailed { .. } => "snippet_extraction_failed",
            ReviewError::LlmSchemaFailure { .. } => "llm_schema_failure",
            ReviewError::LlmRequest { .. } => "llm_request",
            ReviewError::AnchoringDegraded { .. } => "anchoring_degraded",
            ReviewError::PublishFailed { .. } => "publish_failed",
            ReviewError::CircuitOpen { .. } => "circuit_open",
            ReviewError::NodeTimeout { .. } => "node_timeout",
            ReviewError::Cancelled => "cancelled",
            ReviewError::Clone { .. } => "clone_error",
            ReviewError::Config { .. } => "config_error",
            ReviewError::Store(_) => "store_error",
            ReviewError::Io(_) => "io_error",
        }
    }

    /// Whether the error is recoverable within or across runs.
    ///
    /// Recoverable errors degrade the nearest bounded stage (partial results
    /// plus a warning); fatal errors abort the run.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            ReviewError::InvalidDiffFormat { .. }
                | ReviewError::GitHubRateLimit { .. }
                | ReviewError::KgQueryTimeout { .. }
                | ReviewError::KgUnavailable { .. }
                | ReviewError::SnippetExtractionFailed { .. }
                | ReviewError::LlmSchemaFailure { .. }
                | ReviewError::AnchoringDegraded { .. }
                | ReviewError::PublishFailed { .. }
                | ReviewError::CircuitOpen { .. }
        )
    }

    /// Serializable report for logging and persistence.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().to_string(),
            message: self.to_string(),
            recoverable: self.recoverable(),
            details: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }
}

/// Structured error record carried in run results and logs.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
