//! Reading stored observations

use anyhow::{bail, Result};
use chrono::NaiveDate;
use forest_lib::{Coordinate, ResultStore};

use crate::config::AgentConfig;
use crate::output::{self, OutputFormat};

/// Show the stored observation for one site and day
pub async fn show_observation(
    config: &AgentConfig,
    site: Coordinate,
    date: NaiveDate,
    format: OutputFormat,
) -> Result<()> {
    let store = super::open_store(config)?;

    let Some(record) = store.read(date, site).await? else {
        bail!("no observation stored for {} at {}", date, site);
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
        OutputFormat::Table => {
            output::print_info(&format!("Observation {}", record.key()));
            println!("{}", output::probability_table(&record.result));
            println!("Model:       {}", record.result.model());
            println!("Recorded at: {}", record.recorded_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }

    Ok(())
}

/// List stored observations for a site, oldest first
pub async fn show_history(
    config: &AgentConfig,
    site: Coordinate,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    format: OutputFormat,
) -> Result<()> {
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            bail!("--from {} is after --to {}", from, to);
        }
    }

    let store = super::open_store(config)?;
    let records = store.history(site, from, to).await?;

    if format == OutputFormat::Table {
        output::print_info(&format!("History for {}", site));
    }
    output::print_records(&records, format)
}
