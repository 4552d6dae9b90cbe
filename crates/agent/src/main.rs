//! Forest health agent
//!
//! Runs a single observation for a site and day, arms daily monitoring of
//! one or more sites, or reads back what has been stored.

use anyhow::Result;
use clap::Parser;
use forest_agent::cli::{Cli, Commands};
use forest_agent::commands::{history, monitor, run};
use forest_agent::config::AgentConfig;
use forest_agent::output;
use forest_lib::{Coordinate, Credential, PipelineError};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit status when the provider has no imagery for the requested day
const EXIT_NO_IMAGERY: u8 = 3;
/// Exit status for any other pipeline stage failure
const EXIT_PIPELINE: u8 = 2;

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let mut config = AgentConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.store.path = db;
    }

    match cli.command {
        Commands::Run {
            lat,
            lon,
            date,
            api_key,
            save_image,
            conflict_policy,
        } => {
            if let Some(policy) = conflict_policy {
                config.store.conflict_policy = policy;
            }
            let args = run::RunArgs {
                site: Coordinate::new(lat, lon)?,
                date,
                credential: Credential::new(api_key),
                save_image,
            };
            run::run_observation(&config, args, cli.format).await?;
        }
        Commands::Monitor {
            sites,
            at,
            api_key,
            port,
        } => {
            if let Some(port) = port {
                config.api_port = port;
            }
            let args = monitor::MonitorArgs {
                sites,
                fire_time: at,
                credential: Credential::new(api_key),
            };
            monitor::run_monitor(&config, args).await?;
        }
        Commands::Show { lat, lon, date } => {
            history::show_observation(&config, Coordinate::new(lat, lon)?, date, cli.format).await?;
        }
        Commands::History { lat, lon, from, to } => {
            history::show_history(&config, Coordinate::new(lat, lon)?, from, to, cli.format).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, matches!(cli.command, Commands::Monitor { .. }));

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<PipelineError>() {
            Some(pipeline) => {
                eprintln!("stage={} cause={}", pipeline.stage, pipeline.cause);
                if pipeline.is_no_imagery() {
                    ExitCode::from(EXIT_NO_IMAGERY)
                } else {
                    ExitCode::from(EXIT_PIPELINE)
                }
            }
            None => {
                output::print_error(&format!("{:#}", err));
                ExitCode::FAILURE
            }
        },
    }
}
