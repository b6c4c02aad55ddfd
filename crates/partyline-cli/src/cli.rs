//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "partyline", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    pub verbose: bool,

    /// Print state changes as JSON lines
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a scripted scenario against the simulated relay
    Run {
        /// Scenario file; the built-in two-device scenario is used if omitted
        #[arg(short, long)]
        scenario: Option<PathBuf>,

        /// Pace each simulation step in wall-clock time
        #[arg(long)]
        realtime: bool,
    },
    /// Print the built-in scenario as TOML
    DefaultScenario,
    /// Check a scenario file without running it
    Validate {
        scenario: PathBuf,
    },
}
