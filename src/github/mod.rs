//! GitHub REST client for the read and write sides of a review run.
//!
//! Reads PR metadata and the paged file list; writes one review with
//! inline comments. Rate limits are honored via `retry-after`; auth and
//! permission failures map to typed errors. Webhook signature
//! verification lives here too, for the outer receiver to call.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::GithubConfig;
use crate::diff::RawFileChange;
use crate::error::{ReviewError, Result};
use crate::types::ChangeType;

const FILES_PER_PAGE: u32 = 100;
const ACCEPT_HEADER: &str = "application/vnd.github+json";

/// PR metadata from the read side.
#[derive(Debug, Clone, Deserialize)]
pub struct PrMetadata {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    pub state: String,
    pub head: GitRef,
    pub base: GitRef,
    #[serde(default)]
    pub changed_files: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitRef {
    pub sha: String,
}

/// One entry of the PR file list.
#[derive(Debug, Clone, Deserialize)]
pub struct PrFileEntry {
    pub filename: String,
    pub status: String,
    #[serde(default)]
    pub additions: u32,
    #[serde(default)]
    pub deletions: u32,
    #[serde(default)]
    pub changes: u32,
    #[serde(default)]
    pub patch: Option<String>,
    #[serde(default)]
    pub previous_filename: Option<String>,
}

impl PrFileEntry {
    fn change_type(&self) -> ChangeType {
        match self.status.as_str() {
            "added" => ChangeType::Added,
            "removed" => ChangeType::Deleted,
            "renamed" => ChangeType::Renamed,
            _ => ChangeType::Modified,
        }
    }
}

/// Convert file entries into the parser's input shape.
pub fn to_raw_changes(entries: &[PrFileEntry]) -> Vec<RawFileChange> {
    entries
        .iter()
        .map(|entry| RawFileChange {
            path: entry.filename.clone(),
            previous_path: entry.previous_filename.clone(),
            change_type: entry.change_type(),
            additions: entry.additions,
            deletions: entry.deletions,
            changes: entry.changes,
            patch: entry.patch.clone(),
        })
        .collect()
}

/// One inline comment in a review submission.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewComment {
    pub path: String,
    /// Absolute new-file line number
    pub line: u32,
    pub side: &'static str,
    pub body: String,
}

/// A review to submit in one POST.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewSubmission {
    pub body: String,
    pub event: &'static str,
    pub comments: Vec<ReviewComment>,
}

#[derive(Deserialize)]
struct ReviewResponse {
    id: i64,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// GitHub REST API client scoped to one installation token.
pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    rate_limit_retries: u32,
}

impl GithubClient {
    pub fn new(config: &GithubConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("loupe-review")
            .build()
            .map_err(|e| ReviewError::GitHubApi { status: 0, message: e.to_string() })?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.resolve_token(),
            rate_limit_retries: config.rate_limit_retries,
        })
    }

    /// `GET /repos/{owner}/{repo}/pulls/{n}`
    pub async fn get_pull_request(&self, owner_repo: &str, pr_number: u64) -> Result<PrMetadata> {
        let url = format!("{}/repos/{owner_repo}/pulls/{pr_number}", self.base_url);
        let response = self.get_with_rate_limit(&url, &[]).await?;
        self.check_status(response, owner_repo, pr_number)
            .await?
            .json()
            .await
            .map_err(|e| ReviewError::GitHubApi {
                status: 0,
                message: format!("bad PR metadata body: {e}"),
            })
    }

    /// `GET /repos/{owner}/{repo}/pulls/{n}/files`, paging 100 at a time.
    pub async fn list_pull_request_files(
        &self,
        owner_repo: &str,
        pr_number: u64,
    ) -> Result<Vec<PrFileEntry>> {
        let url = format!("{}/repos/{owner_repo}/pulls/{pr_number}/files", self.base_url);
        let mut entries = Vec::new();
        let mut page = 1u32;

        loop {
            let query = [
                ("per_page", FILES_PER_PAGE.to_string()),
                ("page", page.to_string()),
            ];
            let response = self.get_with_rate_limit(&url, &query).await?;
            let batch: Vec<PrFileEntry> = self
                .check_status(response, owner_repo, pr_number)
                .await?
                .json()
                .await
                .map_err(|e| ReviewError::GitHubApi {
                    status: 0,
                    message: format!("bad file list body: {e}"),
                })?;

            let batch_len = batch.len();
            entries.extend(batch);
            if batch_len < FILES_PER_PAGE as usize {
                break;
            }
            page += 1;
        }

        debug!("fetched {} changed files for {owner_repo}#{pr_number}", entries.len());
        Ok(entries)
    }

    /// `POST /repos/{owner}/{repo}/pulls/{n}/reviews`; returns the review id.
    pub async fn create_review(
        &self,
        owner_repo: &str,
        pr_number: u64,
        submission: &ReviewSubmission,
    ) -> Result<i64> {
        let url = format!("{}/repos/{owner_repo}/pulls/{pr_number}/reviews", self.base_url);
        let response = self
            .request(self.http.post(&url).json(submission))
            .await?;
        let response = self.check_status(response, owner_repo, pr_number).await?;
        let review: ReviewResponse = response.json().await.map_err(|e| ReviewError::GitHubApi {
            status: 0,
            message: format!("bad review response body: {e}"),
        })?;
        info!("review {} created on {owner_repo}#{pr_number}", review.id);
        Ok(review.id)
    }

    async fn get_with_rate_limit(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            let response = self.request(self.http.get(url).query(query)).await?;

            if response.status().as_u16() == 429 {
                let retry_after = parse_retry_after(&response).unwrap_or(60);
                attempt += 1;
                if attempt > self.rate_limit_retries {
                    return Err(ReviewError::GitHubRateLimit { retry_after_secs: retry_after });
                }
                warn!("rate limited, sleeping {retry_after}s (attempt {attempt})");
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            if let Some(remaining) = rate_limit_remaining(&response) {
                if remaining < 10 {
                    debug!("rate limit nearly exhausted: {remaining} calls left");
                }
            }
            return Ok(response);
        }
    }

    async fn request(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut builder = builder.header("accept", ACCEPT_HEADER);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
            .send()
            .await
            .map_err(|e| ReviewError::GitHubApi { status: 0, message: e.to_string() })
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
        owner_repo: &str,
        pr_number: u64,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .map(|b| b.message)
            .unwrap_or_default();

        Err(match status.as_u16() {
            401 => ReviewError::GitHubAuthentication,
            403 => ReviewError::GitHubPermission,
            404 => ReviewError::GitHubPrNotFound {
                owner_repo: owner_repo.to_string(),
                pr_number,
            },
            429 => ReviewError::GitHubRateLimit { retry_after_secs: 60 },
            code => ReviewError::GitHubApi { status: code, message },
        })
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn rate_limit_remaining(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

type HmacSha256 = Hmac<Sha256>;

/// Verify a webhook signature: HMAC-SHA256 hex digest of the raw body,
/// `sha256=` prefix, constant-time compare.
pub fn verify_webhook_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
