//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use forest_lib::{ClassificationResult, StoredRecord};
use tabled::{builder::Builder, settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// One label's probability
#[derive(Tabled)]
struct ProbabilityRow {
    #[tabled(rename = "Condition")]
    label: String,
    #[tabled(rename = "Probability")]
    probability: String,
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format a probability as a percentage
pub fn format_probability(p: f64) -> String {
    format!("{:.1}%", p * 100.0)
}

/// Color a condition label by severity
pub fn color_label(label: &str) -> String {
    match label.to_lowercase().as_str() {
        "healthy" => label.green().to_string(),
        "degraded" => label.yellow().to_string(),
        "deforested" => label.red().to_string(),
        _ => label.to_string(),
    }
}

/// Table of one result's probabilities, dominant label highlighted
pub fn probability_table(result: &ClassificationResult) -> String {
    let (dominant, _) = result.dominant();
    let rows: Vec<ProbabilityRow> = result
        .iter()
        .map(|(label, p)| ProbabilityRow {
            label: if label == dominant {
                color_label(label).bold().to_string()
            } else {
                label.to_string()
            },
            probability: format_probability(p),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Table with one row per stored day and one column per label
pub fn history_table(records: &[StoredRecord]) -> String {
    let mut builder = Builder::default();

    if let Some(first) = records.first() {
        let mut header = vec!["Date".to_string()];
        header.extend(first.result.labels().iter().map(String::from));
        header.extend(["Dominant".to_string(), "Model".to_string()]);
        builder.push_record(header);
    }

    for record in records {
        let (dominant, _) = record.result.dominant();
        let mut row = vec![record.result.date().to_string()];
        row.extend(record.result.probabilities().iter().map(|p| format_probability(*p)));
        row.push(color_label(dominant));
        row.push(record.result.model().to_string());
        builder.push_record(row);
    }

    builder.build().with(Style::rounded()).to_string()
}

/// Print records as a table or JSON
pub fn print_records(records: &[StoredRecord], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(records)?),
        OutputFormat::Table => {
            if records.is_empty() {
                print_warning("No observations found");
            } else {
                println!("{}", history_table(records));
                println!("\nTotal: {} observations", records.len());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use forest_lib::{Coordinate, LabelSet};

    fn record(date: (i32, u32, u32), probabilities: Vec<f64>) -> StoredRecord {
        let result = ClassificationResult::new(
            NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            Coordinate::new(48.8566, 2.3522).unwrap(),
            LabelSet::default(),
            probabilities,
            "vegetation-index",
        )
        .unwrap();
        StoredRecord::new(result, None)
    }

    #[test]
    fn test_format_probability() {
        assert_eq!(format_probability(0.7), "70.0%");
        assert_eq!(format_probability(0.0125), "1.2%");
    }

    #[test]
    fn test_history_table_has_label_columns() {
        colored::control::set_override(false);
        let table = history_table(&[
            record((2024, 1, 1), vec![0.7, 0.2, 0.1]),
            record((2024, 1, 2), vec![0.1, 0.2, 0.7]),
        ]);

        assert!(table.contains("Healthy"));
        assert!(table.contains("Deforested"));
        assert!(table.contains("2024-01-02"));
        assert!(table.contains("70.0%"));
    }

    #[test]
    fn test_probability_table_lists_every_label() {
        colored::control::set_override(false);
        let table = probability_table(&record((2024, 1, 1), vec![0.7, 0.2, 0.1]).result);
        for label in ["Healthy", "Degraded", "Deforested"] {
            assert!(table.contains(label));
        }
    }
}
