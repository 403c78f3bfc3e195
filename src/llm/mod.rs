//! Narrow completion interface over the LLM provider.
//!
//! The pipeline only ever needs one call: prompt in, text plus usage out.
//! The HTTP implementation speaks the OpenAI-compatible chat completions
//! shape; anything provider-specific stays behind the trait.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ModelConfig;
use crate::error::{ReviewError, Result};

/// One completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Token counts reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Provider response, normalized.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
    pub stop_reason: Option<String>,
}

/// The single operation the pipeline requires from a provider.
pub trait CompletionClient: Send + Sync {
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse>> + Send;
}

/// OpenAI-compatible chat completions client.
pub struct HttpCompletionClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl HttpCompletionClient {
    /// Build a client from model configuration and the per-call timeout.
    pub fn new(config: &ModelConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReviewError::LlmRequest { message: e.to_string() })?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.resolve_api_key(),
        })
    }
}

impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: vec![
                ChatMessage { role: "system", content: &request.system },
                ChatMessage { role: "user", content: &request.prompt },
            ],
        };

        let mut builder = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ReviewError::LlmRequest { message: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ReviewError::LlmRequest {
                message: format!("HTTP {status}: {}", text.chars().take(300).collect::<String>()),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ReviewError::LlmRequest { message: format!("bad response body: {e}") })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| ReviewError::LlmRequest {
            message: "response carried no choices".to_string(),
        })?;

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            usage: parsed
                .usage
                .map(|u| TokenUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            stop_reason: choice.finish_reason,
        })
    }
}

/// Per-million-token prices, looked up by model-name prefix.
///
/// Cost is computed locally; unknown models cost zero rather than failing
/// the run.
const PRICE_TABLE: [(&str, f64, f64); 6] = [
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4.1", 2.00, 8.00),
    ("claude-3-5-haiku", 0.80, 4.00),
    ("claude-sonnet", 3.00, 15.00),
    ("claude-opus", 15.00, 75.00),
];

/// Estimate the cost of one run in USD from the local price table.
pub fn estimate_cost_usd(model: &str, usage: &TokenUsage) -> f64 {
    let lower = model.to_lowercase();
    for (prefix, input_price, output_price) in PRICE_TABLE {
        if lower.starts_with(prefix) {
            return usage.input_tokens as f64 / 1e6 * input_price
                + usage.output_tokens as f64 / 1e6 * output_price;
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_lookup_by_prefix() {
        let usage = TokenUsage { input_tokens: 1_000_000, output_tokens: 1_000_000 };
        assert!((estimate_cost_usd("gpt-4o-mini-2024-07-18", &usage) - 0.75).abs() < 1e-9);
        assert!((estimate_cost_usd("gpt-4o", &usage) - 12.5).abs() < 1e-9);
        assert_eq!(estimate_cost_usd("some-unknown-model", &usage), 0.0);
    }

    #[test]
    fn test_mini_matches_before_base_model() {
        // Longest-prefix entry sits first in the table
        let usage = TokenUsage { input_tokens: 2_000_000, output_tokens: 0 };
        assert!((estimate_cost_usd("gpt-4o-mini", &usage) - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(TokenUsage { input_tokens: 10, output_tokens: 5 });
        total.add(TokenUsage { input_tokens: 7, output_tokens: 2 });
        assert_eq!(total.input_tokens, 17);
        assert_eq!(total.output_tokens, 7);
    }

    #[test]
    fn test_chat_response_parses_minimal_body() {
        let json = r#"{"choices":[{"message":{"content":"{}"},"finish_reason":"stop"}]}"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("{}"));
        assert!(parsed.usage.is_none());
    }

    #[tokio::test]
    async fn test_connection_refused_is_llm_request_error() {
        let config = ModelConfig {
            base_url: "http://127.0.0.1:19998/v1".to_string(),
            api_key: None,
            ..Default::default()
        };
        let client = HttpCompletionClient::new(&config, Duration::from_secs(2)).unwrap();
        let err = client
            .complete(&CompletionRequest {
                system: "s".to_string(),
                prompt: "p".to_string(),
                max_tokens: 16,
                temperature: 0.0,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "llm_request");
    }
}
