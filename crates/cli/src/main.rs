//! visfix CLI - Main Entry Point
//!
//! Review detected visual diffs, update baselines, and repair stylesheet
//! regressions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod context;
mod output;

use commands::{backups, confirm, kb, patch, run};

/// visfix - visual regression decision-and-repair engine
#[derive(Parser)]
#[command(name = "visfix")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "VISFIX_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Confirm(confirm::ConfirmCommands),

    #[command(flatten)]
    Run(run::RunCommands),

    /// Knowledge base of verified fixes
    #[command(subcommand)]
    Kb(kb::KbCommands),

    #[command(flatten)]
    Patch(patch::PatchCommands),

    /// Manage patch backups
    #[command(subcommand)]
    Backups(backups::BackupCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    if let Commands::Version = cli.command {
        println!("visfix v{}", visfix_common::VERSION);
        return Ok(());
    }

    let ctx = context::Context::load(cli.config, cli.format)?;

    let result = match cli.command {
        Commands::Confirm(cmd) => confirm::execute(cmd, &ctx).await,
        Commands::Run(cmd) => run::execute(cmd, &ctx).await,
        Commands::Kb(cmd) => kb::execute(cmd, &ctx).await,
        Commands::Patch(cmd) => patch::execute(cmd, &ctx).await,
        Commands::Backups(cmd) => backups::execute(cmd, &ctx).await,
        Commands::Version => Ok(()),
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}
