mod context;
mod review;
mod status;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "loupe")]
#[command(about = "AI-assisted pull request review pipeline")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Configuration file path
    #[arg(long, global = true, value_name = "PATH", default_value = "loupe.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full review pipeline for a pull request
    Review(review::ReviewArgs),

    /// Assemble and print the context pack without generating a review
    Context(context::ContextArgs),

    /// Show recent review runs
    Status(status::StatusArgs),
}

/// Output settings shared by all commands
pub struct OutputConfig {
    pub json: bool,
    pub quiet: bool,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let output = OutputConfig { json: self.json, quiet: self.quiet };
        let config = crate::config::Config::load(&self.config)?;

        match self.command {
            Commands::Review(args) => review::run(args, &config, &output).await,
            Commands::Context(args) => context::run(args, &config, &output).await,
            Commands::Status(args) => status::run(args, &config, &output),
        }
    }
}
