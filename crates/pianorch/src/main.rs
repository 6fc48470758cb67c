//! pianorch - orchestrate piano MIDI files onto a layered ensemble
//!
//! Subcommands:
//! - `pianorch orchestrate <files>...` - Re-channel notes by pitch layer and beat schedule
//! - `pianorch roundtrip <files>...` - Parse and rewrite without changes, then verify
//! - `pianorch dump <file>` - Print the note matrix as CSV
//! - `pianorch config` - Print the effective configuration

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use orchconf::OrchConfig;

mod commands;
mod telemetry;

#[derive(Parser)]
#[command(name = "pianorch")]
#[command(about = "Orchestrate piano MIDI onto strings and winds")]
#[command(version)]
struct Cli {
    /// Config file, replacing ./pianorch.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of configuration
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print a JSON summary instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Orchestrate one or more MIDI files
    Orchestrate {
        /// Input MIDI files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output directory (default: next to each input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write a side-by-side CSV of input and output notes
        #[arg(long)]
        table: bool,
    },

    /// Rewrite files without orchestration and verify the notes survive
    Roundtrip {
        /// Input MIDI files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output directory (default: next to each input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write a side-by-side CSV of input and re-read notes
        #[arg(long)]
        table: bool,

        /// Allowed drift in ticks (default from config)
        #[arg(long)]
        tolerance: Option<u64>,
    },

    /// Print the note matrix of a file as CSV
    Dump {
        /// Input MIDI file
        input: PathBuf,

        /// Show orchestration columns
        #[arg(long)]
        orchestrate: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// List the files and environment variables that contributed
        #[arg(long)]
        show_sources: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = OrchConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    telemetry::init(&config.telemetry, cli.verbose);

    let failed = match cli.command {
        Commands::Orchestrate {
            inputs,
            output,
            table,
        } => {
            let options = commands::RunOptions::new(&config, output, table, None, cli.json);
            commands::orchestrate(&inputs, &config, &options)?
        }
        Commands::Roundtrip {
            inputs,
            output,
            table,
            tolerance,
        } => {
            let options = commands::RunOptions::new(&config, output, table, tolerance, cli.json);
            commands::roundtrip(&inputs, &options)?
        }
        Commands::Dump { input, orchestrate } => {
            commands::dump(&input, orchestrate.then_some(&config))?;
            0
        }
        Commands::Config { show_sources } => {
            commands::show_config(&config, show_sources.then_some(&sources));
            0
        }
    };

    if failed > 0 {
        bail!("{failed} file(s) failed");
    }
    Ok(())
}
