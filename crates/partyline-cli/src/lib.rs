//! partyline scenario runner
//!
//! Drives scripted sessions through the simulated relay and matchmaker so
//! the whole party lifecycle can be exercised from the command line.

pub mod cli;
pub mod config;
pub mod error;
pub mod scenario;

pub use config::{MatchmakingSettings, ScenarioConfig, ScenarioSettings};
pub use error::{CliError, Result};
pub use scenario::{ScenarioReport, ScenarioRunner};
