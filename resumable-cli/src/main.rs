//! Resumable CLI: inspect checkpoint directories and run a preemptible demo.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Resumable: checkpoint and recovery for preemptible training jobs
#[derive(Parser, Debug)]
#[command(name = "resumable", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Verify a checkpoint file and print a summary
    Inspect {
        /// Checkpoint file
        file: PathBuf,
        /// Print the full record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the latest checkpoint of a family
    Latest {
        /// Checkpoint directory (defaults to the configured weights path)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Checkpoint family
        #[arg(long, value_enum, default_value_t = Family::Hpc)]
        family: Family,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
    /// Run a toy training loop that restores, handles preemption, and saves per epoch
    Demo {
        /// Epochs to train in total
        #[arg(long, default_value_t = 5)]
        epochs: u64,
        /// Batches per epoch
        #[arg(long, default_value_t = 20)]
        batches: u64,
        /// Number of model parameters
        #[arg(long, default_value_t = 8)]
        params: usize,
        /// Delay after every batch, in milliseconds
        #[arg(long, default_value_t = 50)]
        batch_delay_ms: u64,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Print the resolved configuration as TOML
    Show,
    /// Write a default `.resumable/config.toml` into the workspace
    Init,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Family {
    /// Preemption checkpoints
    Hpc,
    /// Regular per-epoch checkpoints
    Regular,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "resumable", "resumable")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "resumable.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}
