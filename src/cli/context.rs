use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::OutputConfig;
use crate::config::Config;
use crate::github::GithubClient;
use crate::kg::KgQueryService;
use crate::observe::{BreakerRegistry, MetricsCollector, NodeTracker};
use crate::pipeline::assemble_context;
use crate::types::ReviewRequest;

#[derive(Args)]
pub struct ContextArgs {
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
}

pub async fn run(args: ContextArgs, config: &Config, output: &OutputConfig) -> Result<()> {
    let request = ReviewRequest {
        installation_id: 1,
        repo_id: args.repo_id,
        github_repo_id: 1,
        github_repo_name: args.repo.clone(),
        pr_number: args.pr,
        head_sha: args.head_sha.to_lowercase(),
        base_sha: args.base_sha.to_lowercase(),
    };

    let github = GithubClient::new(&config.github, config.timeouts.github_api())?;
    let kg = match KgQueryService::connect(&config.kg, &config.timeouts).await {
        Ok(kg) => Some(kg),
        Err(e) => {
            if !output.quiet {
                eprintln!("{} KG unavailable: {e}", "warning:".yellow());
            }
            None
        }
    };
    let metrics = MetricsCollector::new();
    let nodes = NodeTracker::new(32);
    let breakers = BreakerRegistry::new(&config.breaker);

    let assembly = assemble_context(
        config,
        &github,
        kg.as_ref(),
        &metrics,
        &nodes,
        &breakers,
        &request,
        &CancellationToken::new(),
    )
    .await
    .with_context(|| format!("context assembly for {}#{} failed", args.repo, args.pr))?;

    if output.json {
        println!("{}", serde_json::to_string_pretty(&assembly.pack)?);
        return Ok(());
    }

    println!(
        "{} {} files changed ({} parseable), {} seed symbols, {} context items, {} chars",
        "context:".bold(),
        assembly.total_files_changed,
        assembly.parseable_files,
        assembly.seeds.symbols.len(),
        assembly.pack.items.len(),
        assembly.pack.stats.total_characters
    );
    for item in &assembly.pack.items {
        println!(
            "  [{}] {}:{}-{} ({:.2})",
            item.item_id, item.file_path, item.start_line, item.end_line, item.relevance_score
        );
    }
    for warning in &assembly.pack.warnings {
        println!("  {} {warning}", "warning:".yellow());
    }

    Ok(())
}
