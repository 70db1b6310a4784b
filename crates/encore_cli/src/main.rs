//! ENCORE CLI
//!
//! Inspect, summarize and compare simulation checkpoints.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod commands;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "encore")]
#[command(about = "ENCORE - Deterministic replay cache for simulations", long_about = None)]
struct Cli {
    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the records of a checkpoint
    Inspect {
        /// Checkpoint file
        file: PathBuf,
        /// Only records of this method (`Type::method` or `method`)
        #[arg(short, long)]
        method: Option<String>,
    },
    /// Count recorded calls per method
    Stats {
        /// Checkpoint file
        file: PathBuf,
    },
    /// Compare two checkpoints; exits with status 1 when they differ
    Diff {
        /// First checkpoint
        left: PathBuf,
        /// Second checkpoint
        right: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("encore=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();
    let cli = Cli::parse();
    let mut stdout = std::io::stdout().lock();

    match cli.command {
        Commands::Inspect { file, method } => {
            let checkpoint = commands::load(&file)?;
            commands::inspect(&mut stdout, &checkpoint, method.as_deref(), cli.json)
        }
        Commands::Stats { file } => {
            let checkpoint = commands::load(&file)?;
            commands::stats(&mut stdout, &checkpoint, cli.json)
        }
        Commands::Diff { left, right } => {
            let left = commands::load(&left)?;
            let right = commands::load(&right)?;
            if !commands::diff(&mut stdout, &left, &right, cli.json)? {
                stdout.flush()?;
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
