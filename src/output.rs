use crate::cooccurrence::{CooccurrenceReport, category_label};
use crate::scoring::ModelSummary;
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{v:.precision$}"),
        None => "-".to_string(),
    }
}

/// Render the per-model summary as a plain table
pub fn render_summary_plain(summaries: &[ModelSummary]) -> String {
    if summaries.is_empty() {
        return "No observations found.\n".to_string();
    }

    let mut out = format!(
        "{:<20} {:>6} {:>6} {:>5} {:>8} {:>8} {:>10} {:>10} {:>10}\n",
        "Model", "N", "True", "Takes", "Acc", "Std", "Tok in", "Tok out", "Cost $"
    );
    out.push_str(&"-".repeat(91));
    out.push('\n');

    for s in summaries {
        out.push_str(&format!(
            "{:<20} {:>6} {:>6} {:>5} {:>8.4} {:>8} {:>10} {:>10} {:>10}\n",
            s.model,
            s.num_observations,
            s.true_observations,
            s.takes,
            s.acc_mean,
            fmt_opt(s.acc_stdvar, 4),
            fmt_opt(s.avg_tokens_in, 1),
            fmt_opt(s.avg_tokens_out, 1),
            fmt_opt(s.price_total, 6),
        ));
    }
    out
}

/// Render the error distribution, totals and co-occurrence matrix
pub fn render_cooccurrence_plain(report: &CooccurrenceReport) -> String {
    if report.totals.is_empty() {
        return "No error categories found.\n".to_string();
    }

    let categories: Vec<u8> = report.totals.keys().copied().collect();
    let mut out = String::from("Error counts by model:\n");
    out.push_str(&format!("{:<20}", "Model"));
    for category in &categories {
        out.push_str(&format!(" {:>14}", category));
    }
    out.push('\n');
    for model in &report.distribution {
        out.push_str(&format!("{:<20}", model.model));
        for category in &categories {
            let count = model.counts.get(category).copied().unwrap_or(0);
            let percent = model.percentages.get(category).copied().unwrap_or(0.0);
            out.push_str(&format!(" {:>6} ({:>5.1}%)", count, percent));
        }
        out.push('\n');
    }

    out.push_str("\nTotal errors by type:\n");
    for (category, total) in &report.totals {
        out.push_str(&format!(
            "{:>2} {:<28} {:>6}\n",
            category,
            category_label(*category),
            total
        ));
    }

    let matrix = &report.matrix;
    out.push_str("\nError type co-occurrence (%):\n");
    out.push_str(&format!("{:<4}", ""));
    for category in &matrix.categories {
        out.push_str(&format!(" {:>6}", category));
    }
    out.push('\n');
    for (row, category) in matrix.percent.iter().zip(&matrix.categories) {
        out.push_str(&format!("{:<4}", category));
        for cell in row {
            out.push_str(&format!(" {:>6.1}", cell));
        }
        out.push('\n');
    }
    out
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing results to JSON: {}", e),
    }
}

/// Print the per-model summary in the specified format
pub fn print_summary(summaries: &[ModelSummary], format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", render_summary_plain(summaries)),
        OutputFormat::Json => print_json(summaries),
    }
}

pub fn print_cooccurrence(report: &CooccurrenceReport, format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", render_cooccurrence_plain(report)),
        OutputFormat::Json => print_json(report),
    }
}

/// Write rows as a CSV spreadsheet with a header line
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("Failed to write CSV row: {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush CSV file: {}", path.display()))?;
    Ok(())
}
