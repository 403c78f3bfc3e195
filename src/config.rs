use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for Loupe
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub limits: LimitsConfig,
    pub timeouts: TimeoutsConfig,
    pub parallelism: ParallelismConfig,
    pub breaker: BreakerConfig,
    pub model: ModelConfig,
    pub kg: KgConfig,
    pub github: GithubConfig,
    pub store: StoreConfig,
    pub operational: OperationalConfig,
}

/// Hard caps applied by each pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Fatal `pr_too_large` above this many changed files
    pub max_changed_files: usize,
    pub max_seed_symbols: usize,
    pub max_seed_files: usize,
    pub max_kg_symbol_matches_per_seed: usize,
    pub max_callers_per_seed: usize,
    pub max_callees_per_seed: usize,
    pub max_contains_per_seed: usize,
    pub max_import_files_per_seed_file: usize,
    pub max_kg_docs_total: usize,
    pub max_context_items: usize,
    pub max_total_characters: usize,
    /// Findings kept after normalization (schema hard cap is 20)
    pub max_findings: usize,
    pub max_file_size_bytes: u64,
    /// Lines longer than this are truncated with a marker suffix
    pub max_line_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_changed_files: 50,
            max_seed_symbols: 25,
            max_seed_files: 25,
            max_kg_symbol_matches_per_seed: 5,
            max_callers_per_seed: 5,
            max_callees_per_seed: 5,
            max_contains_per_seed: 5,
            max_import_files_per_seed_file: 10,
            max_kg_docs_total: 20,
            max_context_items: 40,
            max_total_characters: 60_000,
            max_findings: 12,
            max_file_size_bytes: 10 * 1024 * 1024,
            max_line_length: 10_000,
        }
    }
}

/// Per-call and per-node timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub github_api_secs: u64,
    pub kg_connection_secs: u64,
    pub kg_query_secs: u64,
    pub llm_secs: u64,
    pub clone_secs: u64,
    /// Overall budget for a single pipeline node. Must exceed
    /// retries x (call timeout + backoff); see `Config::validate`.
    pub node_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            github_api_secs: 30,
            kg_connection_secs: 10,
            kg_query_secs: 15,
            llm_secs: 120,
            clone_secs: 120,
            node_secs: 480,
        }
    }
}

impl TimeoutsConfig {
    pub fn github_api(&self) -> Duration {
        Duration::from_secs(self.github_api_secs)
    }

    pub fn kg_connection(&self) -> Duration {
        Duration::from_secs(self.kg_connection_secs)
    }

    pub fn kg_query(&self) -> Duration {
        Duration::from_secs(self.kg_query_secs)
    }

    pub fn llm(&self) -> Duration {
        Duration::from_secs(self.llm_secs)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_secs)
    }

    pub fn node(&self) -> Duration {
        Duration::from_secs(self.node_secs)
    }
}

/// Bounded concurrency inside a single run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelismConfig {
    pub max_parallel_kg_calls: usize,
    pub max_parallel_snippet_files: usize,
}

impl Default for ParallelismConfig {
    fn default() -> Self {
        Self {
            max_parallel_kg_calls: 8,
            max_parallel_snippet_files: 4,
        }
    }
}

/// Circuit breaker settings, one breaker per external dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    pub cool_down_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down_ms: 30_000,
        }
    }
}

/// LLM provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Provider label used for metrics and cost lookup
    pub provider: String,
    pub model: String,
    /// OpenAI-compatible chat completions endpoint
    pub base_url: String,
    /// API key — literal value or "env:VAR_NAME" to read from environment
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Reprompts after a schema validation failure
    pub max_retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai-compatible".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: Some("env:LOUPE_LLM_API_KEY".to_string()),
            max_tokens: 4096,
            temperature: 0.1,
            max_retries: 2,
        }
    }
}

impl ModelConfig {
    /// Resolve the API key, supporting "env:VAR_NAME" syntax
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret(self.api_key.as_deref())
    }
}

/// Knowledge graph (bolt) connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KgConfig {
    pub uri: String,
    pub user: String,
    /// Password — literal value or "env:VAR_NAME"
    pub password: Option<String>,
    pub database: String,
    /// Process-wide connection pool size
    pub pool_size: usize,
}

impl Default for KgConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: Some("env:NEO4J_PASSWORD".to_string()),
            database: "neo4j".to_string(),
            pool_size: 8,
        }
    }
}

impl KgConfig {
    pub fn resolve_password(&self) -> Option<String> {
        resolve_secret(self.password.as_deref())
    }
}

/// Code host API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub base_url: String,
    /// Installation token — literal value or "env:VAR_NAME"
    pub token: Option<String>,
    /// Webhook secret for signature verification — literal or "env:VAR_NAME"
    pub webhook_secret: Option<String>,
    /// Attempts when rate limited before giving up
    pub rate_limit_retries: u32,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: Some("env:GITHUB_TOKEN".to_string()),
            webhook_secret: Some("env:LOUPE_WEBHOOK_SECRET".to_string()),
            rate_limit_retries: 3,
        }
    }
}

impl GithubConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret(self.token.as_deref())
    }

    pub fn resolve_webhook_secret(&self) -> Option<String> {
        resolve_secret(self.webhook_secret.as_deref())
    }
}

/// Persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".loupe/loupe.db"),
        }
    }
}

/// Operational toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationalConfig {
    /// Skip the publish stage entirely (findings still persisted)
    pub dry_run: bool,
    /// Keep the clone directory after the run instead of deleting it
    pub keep_clone: bool,
    /// Parent directory for run-scoped clones; system temp when unset
    pub clone_root: Option<PathBuf>,
}

impl Default for OperationalConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            keep_clone: false,
            clone_root: None,
        }
    }
}

/// Resolve a secret value, supporting "env:VAR_NAME" syntax
fn resolve_secret(value: Option<&str>) -> Option<String> {
    value.and_then(|v| {
        if let Some(var_name) = v.strip_prefix("env:") {
            std::env::var(var_name).ok()
        } else if v.is_empty() {
            None
        } else {
            Some(v.to_string())
        }
    })
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_findings > 20 {
            anyhow::bail!(
                "limits.max_findings must be <= 20, got {}",
                self.limits.max_findings
            );
        }
        if self.limits.max_context_items == 0 || self.limits.max_total_characters == 0 {
            anyhow::bail!("context budgets must be non-zero");
        }
        // The node deadline must cover every retry plus backoff, otherwise
        // retries can never complete before the node dies.
        let retries = u64::from(self.model.max_retries) + 1;
        let worst_case_llm = retries * (self.timeouts.llm_secs + backoff_budget_secs(retries));
        if self.timeouts.node_secs <= worst_case_llm {
            anyhow::bail!(
                "timeouts.node_secs ({}) must exceed retries x (llm timeout + backoff) ({})",
                self.timeouts.node_secs,
                worst_case_llm
            );
        }
        Ok(())
    }
}

/// Upper bound on cumulative exponential backoff for the given attempt count.
fn backoff_budget_secs(attempts: u64) -> u64 {
    // 1s base doubling per attempt, capped at 8s per wait
    (0..attempts.saturating_sub(1)).map(|i| (1u64 << i.min(3)).min(8)).sum()
}
