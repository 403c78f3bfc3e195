use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::OutputConfig;
use crate::config::Config;
use crate::github::GithubClient;
use crate::kg::KgQueryService;
use crate::llm::HttpCompletionClient;
use crate::observe::{BreakerRegistry, MetricsCollector, NodeTracker};
use crate::pipeline::{run_review, PipelineServices};
use crate::store::ReviewStore;
use crate::types::ReviewRequest;

#[derive(Args)]
pub struct ReviewArgs {
    /// Repository in owner/repo form
    #[arg(long)]
    repo: String,

    /// Pull request number
    #[arg(long)]
    pr: u64,

    /// PR head commit SHA (40-char hex)
    #[arg(long)]
    head_sha: String,

    /// PR base commit SHA (40-char hex)
    #[arg(long)]
    base_sha: String,

    /// Internal repository id, matching the KG's repo_id
    #[arg(long)]
    repo_id: Uuid,

    /// GitHub App installation id
    #[arg(long, default_value_t = 1)]
    installation_id: i64,

    /// GitHub repository id
    #[arg(long, default_value_t = 1)]
    github_repo_id: i64,

    /// Skip publication (findings are still persisted)
    #[arg(long)]
    dry_run: bool,
}

pub async fn run(args: ReviewArgs, config: &Config, output: &OutputConfig) -> Result<()> {
    let mut config = config.clone();
    if args.dry_run {
        config.operational.dry_run = true;
    }

    let request = ReviewRequest {
        installation_id: args.installation_id,
        repo_id: args.repo_id,
        github_repo_id: args.github_repo_id,
        github_repo_name: args.repo.clone(),
        pr_number: args.pr,
        head_sha: args.head_sha.to_lowercase(),
        base_sha: args.base_sha.to_lowercase(),
    };

    let github = GithubClient::new(&config.github, config.timeouts.github_api())?;
    let llm = HttpCompletionClient::new(&config.model, config.timeouts.llm())?;
    let kg = match KgQueryService::connect(&config.kg, &config.timeouts).await {
        Ok(kg) => Some(kg),
        Err(e) => {
            if !output.quiet {
                eprintln!("{} KG unavailable, reviewing without graph context: {e}", "warning:".yellow());
            }
            None
        }
    };
    let mut store = ReviewStore::open(&config.store.db_path)?;
    let metrics = MetricsCollector::new();
    let nodes = NodeTracker::new(32);
    let breakers = BreakerRegistry::new(&config.breaker);

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });

    let mut services = PipelineServices {
        config: &config,
        github: &github,
        kg: kg.as_ref(),
        llm: &llm,
        store: &mut store,
        metrics: &metrics,
        nodes: &nodes,
        breakers: &breakers,
    };

    let result = run_review(&mut services, &request, &cancel)
        .await
        .with_context(|| format!("review of {}#{} failed", args.repo, args.pr))?;

    if output.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    if !output.quiet {
        let published = if result.published {
            "published".green().to_string()
        } else {
            "not published".yellow().to_string()
        };
        println!(
            "{} {}#{} — {} findings ({} anchored), {published}, {:.1}s, ${:.4}",
            "review complete:".bold(),
            args.repo,
            args.pr,
            result.total_findings,
            result.anchored_findings,
            result.processing_duration_ms as f64 / 1000.0,
            result.cost_usd
        );
        for warning in &result.warnings {
            println!("  {} {warning}", "warning:".yellow());
        }
    }

    Ok(())
}
