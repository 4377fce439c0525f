//! Circuit Consistency CLI - annotation agreement benchmark
//!
//! Command-line interface for the reconciliation and scoring pipeline.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::reconcile::ReconcileCommand;
use commands::run::RunCommand;
use commands::stats::StatsCommand;

#[derive(Parser)]
#[command(
    name = "circuit-consistency",
    version,
    about = "Consistency benchmark between two circuit-diagram annotation sources",
    after_help = "EXAMPLES:\n  \
                  # Analyse every image under the configured root, resuming earlier runs\n  \
                  circuit-consistency run\n\n  \
                  # Start over with 8 concurrent images\n  \
                  circuit-consistency run --no-resume --workers 8\n\n  \
                  # Re-resolve references in an existing results file\n  \
                  circuit-consistency reconcile output/model_analysis.json\n\n  \
                  # Print benchmark statistics\n  \
                  circuit-consistency stats output/model_analysis.json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Annotate, reconcile and score every pending image
    Run(RunCommand),

    /// Re-run entity resolution over an existing results file
    Reconcile(ReconcileCommand),

    /// Print benchmark statistics for a results file
    Stats(StatsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.verbose {
        "circuit_consistency=debug"
    } else {
        "circuit_consistency=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Run(cmd) => cmd.execute(&cli.config).await,
        Commands::Reconcile(cmd) => cmd.execute(&cli.config),
        Commands::Stats(cmd) => cmd.execute(),
    }
}
