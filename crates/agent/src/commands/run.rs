//! One-shot observation

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use colored::Colorize;
use forest_lib::store::SaveOutcome;
use forest_lib::{Coordinate, Credential, HealthRegistry, ObservationRequest, StructuredLogger};
use image::ImageFormat;
use std::path::PathBuf;

use crate::config::AgentConfig;
use crate::output::{self, OutputFormat};

/// Arguments of `forest-agent run`
#[derive(Debug)]
pub struct RunArgs {
    pub site: Coordinate,
    pub date: Option<NaiveDate>,
    pub credential: Credential,
    pub save_image: Option<PathBuf>,
}

/// Acquire, classify and persist one observation
///
/// A pipeline failure is returned unwrapped so the caller can report its stage.
pub async fn run_observation(config: &AgentConfig, args: RunArgs, format: OutputFormat) -> Result<()> {
    let date = args.date.unwrap_or_else(|| Local::now().date_naive());
    let orchestrator = super::build_orchestrator(
        config,
        HealthRegistry::for_pipeline().await,
        StructuredLogger::new(config.instance_name.clone()),
    )?;

    let request = ObservationRequest::new(args.site, date, args.credential);
    let observation = orchestrator.observe(&request).await?;

    if let Some(path) = &args.save_image {
        observation
            .image
            .image()
            .save_with_format(path, ImageFormat::Png)
            .with_context(|| format!("failed to write image to {}", path.display()))?;
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&observation.record)?);
        }
        OutputFormat::Table => {
            let verb = match observation.outcome {
                SaveOutcome::Inserted => "Recorded",
                SaveOutcome::Replaced => "Replaced",
            };
            output::print_success(&format!("{} observation {}", verb, observation.record.key()));

            let (dominant, p) = observation.result().dominant();
            println!();
            println!("{}", output::probability_table(observation.result()));
            println!(
                "{} {} ({})",
                "Dominant:".bold(),
                output::color_label(dominant),
                output::format_probability(p)
            );
            println!("{} {}", "Model:".bold(), observation.result().model());
            if let Some(url) = &observation.record.source_url {
                println!("{} {}", "Source:".bold(), url.dimmed());
            }
            if let Some(path) = &args.save_image {
                output::print_info(&format!(
                    "Saved {}x{} image to {}",
                    observation.image.width(),
                    observation.image.height(),
                    path.display()
                ));
            }
        }
    }

    Ok(())
}
