//! partyline - scripted party sessions against a simulated relay

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use partyline_cli::{
    cli::{Cli, Commands},
    ScenarioConfig, ScenarioRunner,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Run { scenario, realtime } => {
            let config = match &scenario {
                Some(path) => {
                    info!("Loading scenario from: {}", path.display());
                    ScenarioConfig::load_from_file(path)
                        .with_context(|| format!("loading scenario {}", path.display()))?
                }
                None => {
                    info!("Using built-in scenario");
                    ScenarioConfig::default()
                }
            };
            let report = ScenarioRunner::new(config, realtime, cli.json)
                .context("setting up simulated devices")?
                .run()
                .await
                .context("scenario failed")?;
            if cli.json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Commands::DefaultScenario => {
            print!("{}", ScenarioConfig::default().to_toml()?);
        }
        Commands::Validate { scenario } => {
            ScenarioConfig::load_from_file(&scenario)
                .with_context(|| format!("validating {}", scenario.display()))?;
            println!("{} is valid", scenario.display());
        }
    }
    Ok(())
}

/// Log to stderr so stdout carries only scenario output
fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
