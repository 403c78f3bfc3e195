use anyhow::Result;
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use super::OutputConfig;
use crate::config::Config;
use crate::store::ReviewStore;

#[derive(Args)]
pub struct StatusArgs {
    /// Number of runs to show
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Serialize)]
struct StatusRow {
    id: String,
    pr_id: i64,
    status: String,
    published: bool,
    llm_model: String,
    started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

pub fn run(args: StatusArgs, config: &Config, output: &OutputConfig) -> Result<()> {
    let store = ReviewStore::open(&config.store.db_path)?;
    let runs = store.recent_runs(args.limit)?;

    if output.json {
        let rows: Vec<StatusRow> = runs
            .into_iter()
            .map(|run| StatusRow {
                id: run.id,
                pr_id: run.pr_id,
                status: run.status,
                published: run.published,
                llm_model: run.llm_model,
                started_at: run.started_at,
                error_message: run.error_message,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("no review runs recorded");
        return Ok(());
    }

    for run in runs {
        let status = match run.status.as_str() {
            "completed" => run.status.green().to_string(),
            "failed" => run.status.red().to_string(),
            _ => run.status.yellow().to_string(),
        };
        println!(
            "{}  pr {}  {}  published={}  {}  {}",
            run.started_at, run.pr_id, status, run.published, run.llm_model, run.id
        );
        if let Some(error) = run.error_message {
            println!("    {} {error}", "error:".red());
        }
    }

    Ok(())
}
