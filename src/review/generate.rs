//! LLM review generation with schema-coerced retries.
//!
//! Calls the completion endpoint, extracts and normalizes the JSON
//! payload, and reprompts with a compact error digest when the response
//! does not validate. Retries are serialized with exponential backoff and
//! jitter. The generator itself never fails the run: terminal failure
//! yields an empty findings list plus a warning.

use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::llm::{estimate_cost_usd, CompletionClient, CompletionRequest, TokenUsage};

use super::schema::{extract_json, normalize, validate, ReviewOutput};

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 8_000;

/// Outcome of one generation pass, including failed ones.
#[derive(Debug)]
pub struct GenerationResult {
    pub output: ReviewOutput,
    pub warnings: Vec<String>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub model: String,
    pub attempts: u32,
}

/// Drives the completion endpoint and normalizes its output.
pub struct ReviewGenerator<'a, C: CompletionClient> {
    client: &'a C,
    config: &'a ModelConfig,
    max_findings: usize,
}

impl<'a, C: CompletionClient> ReviewGenerator<'a, C> {
    pub fn new(client: &'a C, config: &'a ModelConfig, max_findings: usize) -> Self {
        Self { client, config, max_findings }
    }

    /// Generate a structured review from the prepared prompt.
    ///
    /// Attempts `1 + max_retries` completions. Schema failures reprompt
    /// with the error digest appended; transport failures back off and
    /// retry the same prompt.
    pub async fn generate(&self, system: &str, prompt: &str) -> GenerationResult {
        let mut usage = TokenUsage::default();
        let mut warnings: Vec<String> = Vec::new();
        let mut model = self.config.model.clone();
        let mut current_prompt = prompt.to_string();
        let attempts_allowed = self.config.max_retries + 1;

        for attempt in 1..=attempts_allowed {
            if attempt > 1 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }

            let request = CompletionRequest {
                system: system.to_string(),
                prompt: current_prompt.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            };

            let response = match self.client.complete(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("LLM call failed on attempt {attempt}: {e}");
                    if attempt == attempts_allowed {
                        warnings.push(format!("llm_request_failure:{}", e.code()));
                        return self.failed(warnings, usage, model, attempt);
                    }
                    continue;
                }
            };

            usage.add(response.usage);
            model = response.model.clone();

            match self.parse_attempt(&response.content) {
                Ok((output, mut parse_warnings)) => {
                    warnings.append(&mut parse_warnings);
                    info!(
                        "review generated: {} findings in {} attempt(s)",
                        output.findings.len(),
                        attempt
                    );
                    let cost_usd = estimate_cost_usd(&model, &usage);
                    return GenerationResult { output, warnings, usage, cost_usd, model, attempts: attempt };
                }
                Err(digest) => {
                    warn!("schema validation failed on attempt {attempt}: {digest}");
                    if attempt == attempts_allowed {
                        warnings.push("llm_schema_failure".to_string());
                        return self.failed(warnings, usage, model, attempt);
                    }
                    current_prompt = reprompt(prompt, &digest);
                }
            }
        }

        // Loop always returns; max_retries is bounded
        self.failed(warnings, usage, model, attempts_allowed)
    }

    /// Extract, normalize, and validate one completion.
    fn parse_attempt(&self, content: &str) -> Result<(ReviewOutput, Vec<String>), String> {
        let value = extract_json(content).map_err(|e| e.to_string())?;
        let (output, warnings) = normalize(value, self.max_findings).map_err(|e| e.to_string())?;

        let violations = validate(&output);
        if violations.is_empty() {
            Ok((output, warnings))
        } else {
            Err(violations.join("; "))
        }
    }

    fn failed(
        &self,
        warnings: Vec<String>,
        usage: TokenUsage,
        model: String,
        attempts: u32,
    ) -> GenerationResult {
        let cost_usd = estimate_cost_usd(&model, &usage);
        GenerationResult {
            output: ReviewOutput::empty("Review generation failed; no findings produced."),
            warnings,
            usage,
            cost_usd,
            model,
            attempts,
        }
    }
}

/// Append the compact error digest to the original prompt for a reprompt.
fn reprompt(original: &str, digest: &str) -> String {
    format!(
        "{original}\n\n## Previous attempt rejected\n\nYour previous response was invalid: \
         {digest}\nRespond again with ONLY the JSON object, nothing else.\n"
    )
}

/// Exponential backoff with jitter: base doubles per retry, capped, then
/// scaled by a random factor in [0.5, 1.5).
fn backoff_delay(retry: u32) -> Duration {
    let base = (BACKOFF_BASE_MS << retry.min(3)).min(BACKOFF_CAP_MS);
    let jittered = rand::thread_rng().gen_range((base / 2)..(base + base / 2));
    Duration::from_millis(jittered)
}
