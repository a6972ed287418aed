//! WEFT CLI
//!
//! Runs the demonstration workflow and inspects checkpoint databases.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod demo;
mod progress;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use config::WeftConfig;
use console::style;
use progress::ProgressSink;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use weft_dataflow::TaskStatus;
use weft_storage::RedbCheckpointStore;

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "WEFT - dataflow execution kernel", long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fan-out/fan-in demo
    Run {
        /// JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Squares to compute
        #[arg(short, long, default_value_t = 32)]
        tasks: usize,
        /// Fail the first attempt of every k-th square
        #[arg(long, default_value_t = 0)]
        fail_every: u64,
        /// Checkpoint database, overriding the config file
        #[arg(long)]
        checkpoint_db: Option<PathBuf>,
        /// Hide the progress bar
        #[arg(long)]
        quiet: bool,
    },
    /// Inspect a checkpoint database
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Print the default configuration
    Config,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List stored results
    List {
        /// Database path
        #[arg(long)]
        db: PathBuf,
    },
    /// Remove every stored result
    Clear {
        /// Database path
        #[arg(long)]
        db: PathBuf,
    },
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| eyre!("cannot install logger: {e}"))
}

fn run(
    config: Option<PathBuf>,
    options: demo::DemoOptions,
    checkpoint_db: Option<PathBuf>,
    quiet: bool,
) -> Result<()> {
    let mut config = match config {
        Some(path) => WeftConfig::load(&path)?,
        None => WeftConfig::default(),
    };
    if checkpoint_db.is_some() {
        config.checkpoint_db = checkpoint_db;
    }

    let total = u64::try_from(options.tasks)? + 1;
    let sink = Arc::new(ProgressSink::new(total, !quiet)?);
    let kernel = demo::build_kernel(&config, sink.clone())?;
    println!(
        "{} run {} on {}",
        style("weft").bold(),
        style(kernel.run_id()).dim(),
        config.labels().join(", ")
    );

    let report = demo::run(&kernel, &config.labels(), options)?;
    let summary = &report.summary;
    let verdict = if report.total == report.expected {
        style("ok").green().bold()
    } else {
        style("MISMATCH").red().bold()
    };
    println!("sum of squares: {} ({verdict})", report.total);
    println!(
        "tasks: {} completed, {} failed, {} cancelled",
        summary.count(TaskStatus::Completed),
        summary.count(TaskStatus::Failed),
        summary.count(TaskStatus::Cancelled)
    );
    println!(
        "retries: {}, checkpoint hits: {}, checkpoints written: {}",
        sink.retried(),
        sink.reused(),
        summary.checkpoints.written
    );

    if report.total != report.expected {
        return Err(eyre!("expected {}, got {}", report.expected, report.total));
    }
    Ok(())
}

fn checkpoints(action: CheckpointAction) -> Result<()> {
    match action {
        CheckpointAction::List { db } => {
            let store = RedbCheckpointStore::open(&db)?;
            let entries = store.list()?;
            for entry in &entries {
                println!(
                    "{}  {}  {}",
                    style(entry.key).cyan(),
                    style(entry.stored_at).dim(),
                    entry.value
                );
            }
            println!("{} entries in {}", entries.len(), db.display());
        }
        CheckpointAction::Clear { db } => {
            let store = RedbCheckpointStore::open(&db)?;
            let removed = store.clear()?;
            println!("removed {removed} entries from {}", db.display());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json)?;

    match cli.command {
        Commands::Run {
            config,
            tasks,
            fail_every,
            checkpoint_db,
            quiet,
        } => run(
            config,
            demo::DemoOptions { tasks, fail_every },
            checkpoint_db,
            quiet,
        ),
        Commands::Checkpoints { action } => checkpoints(action),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&WeftConfig::default())?);
            Ok(())
        }
    }
}
