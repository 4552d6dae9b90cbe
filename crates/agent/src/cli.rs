//! Command-line interface

use chrono::{NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use forest_lib::{ConflictPolicy, Coordinate};
use std::path::PathBuf;

use crate::commands;
use crate::output::OutputFormat;

/// Forest health monitoring agent
#[derive(Parser)]
#[command(name = "forest-agent")]
#[command(author, version, about = "Daily satellite observation and forest health classification", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to forest-agent.toml in the working directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Result database path, overriding the configuration
    #[arg(long, global = true, env = "FOREST_DB")]
    pub db: Option<PathBuf>,

    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: OutputFormat,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Observe one site for one day and store the result
    Run {
        /// Latitude in degrees
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        /// Longitude in degrees
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Imagery date (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Imagery provider API key
        #[arg(long, env = "FOREST_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Write the fetched image as PNG
        #[arg(long)]
        save_image: Option<PathBuf>,

        /// What to do when a record for the same day and site exists (replace, reject)
        #[arg(long, value_parser = commands::parse_conflict_policy)]
        conflict_policy: Option<ConflictPolicy>,
    },

    /// Observe sites every day at a fixed local time
    Monitor {
        /// Site as LAT,LON (repeatable)
        #[arg(long = "site", required = true, allow_hyphen_values = true, value_parser = commands::parse_site)]
        sites: Vec<Coordinate>,

        /// Local time of day to run (HH:MM)
        #[arg(long, default_value = "06:00", value_parser = commands::parse_fire_time)]
        at: NaiveTime,

        /// Imagery provider API key
        #[arg(long, env = "FOREST_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Health and metrics port, overriding the configuration
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show the stored observation for one site and day
    Show {
        /// Latitude in degrees
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        /// Longitude in degrees
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Observation date (YYYY-MM-DD)
        #[arg(long)]
        date: NaiveDate,
    },

    /// List stored observations for a site
    History {
        /// Latitude in degrees
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        /// Longitude in degrees
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// First date to include
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last date to include
        #[arg(long)]
        to: Option<NaiveDate>,
    },
}
