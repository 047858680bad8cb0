use crate::codec::read_log_file;
use crate::config::PriceTable;
use crate::models::{Case, UNREPORTED_TOKENS};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// One model answer to one case in one take
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub model: String,
    pub observation_id: String,
    /// Index of the source log among the processed files
    pub take: usize,
    pub source: String,
    /// Model result and row count as compared against the truth
    pub predict: String,
    pub truth: String,
    /// Non-positive counts are stored as -1 and excluded from averages
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub is_correct: bool,
}

/// Per-model statistics across takes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub model: String,
    pub num_observations: usize,
    pub true_observations: usize,
    pub takes: usize,
    /// Unweighted mean of the per-take accuracies
    pub acc_mean: f64,
    /// Sample standard deviation of the per-take accuracies
    pub acc_stdvar: Option<f64>,
    pub avg_tokens_in: Option<f64>,
    pub avg_tokens_out: Option<f64>,
    pub price_token_in: Option<f64>,
    pub price_token_out: Option<f64>,
    pub price_in: Option<f64>,
    pub price_out: Option<f64>,
    pub price_total: Option<f64>,
}

/// Non-positive counts, 0 included, are unreported and never enter an average
fn reported(tokens: i64) -> i64 {
    if tokens > 0 { tokens } else { UNREPORTED_TOKENS }
}

/// Observations for the included models of every case in one take
pub fn observations_from_cases(
    cases: &[Case],
    take: usize,
    source: &str,
    included: &[String],
) -> Vec<Observation> {
    let mut observations = Vec::new();

    for case in cases {
        for output in case
            .model_outputs
            .iter()
            .filter(|o| included.contains(&o.model_name))
        {
            let (predict, truth) = output
                .answer
                .as_ref()
                .and_then(|answer| answer.sides())
                .unwrap_or_default();
            let usage = output.reported_usage();

            observations.push(Observation {
                model: output.model_name.clone(),
                observation_id: case.key.clone(),
                take,
                source: source.to_string(),
                predict,
                truth,
                tokens_in: usage.map_or(UNREPORTED_TOKENS, |u| reported(u.tokens_in)),
                tokens_out: usage.map_or(UNREPORTED_TOKENS, |u| reported(u.tokens_out)),
                is_correct: output.is_correct(),
            });
        }
    }

    observations
}

/// Parse every log (one take per file) into observations
pub fn collect_observations(files: &[PathBuf], included: &[String]) -> Result<Vec<Observation>> {
    let mut observations = Vec::new();

    for (take, path) in files.iter().enumerate() {
        let report = read_log_file(path)?;
        if report.skipped_count() > 0 {
            warn!(
                file = %path.display(),
                skipped = report.skipped_count(),
                "skipped malformed segments"
            );
        }
        let source = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let found = observations_from_cases(&report.cases, take, &source, included);
        debug!(file = %path.display(), observations = found.len(), "parsed take");
        observations.extend(found);
    }

    Ok(observations)
}

/// Mean of the reported counts; `-1` and other non-positive values are left
/// out of both the sum and the count
pub fn average_tokens(values: impl IntoIterator<Item = i64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .filter(|&v| v > 0)
        .fold((0i64, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum as f64 / count as f64)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let variance =
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

/// Per-model summary. Accuracy is computed per take first and then averaged,
/// so every take weighs the same regardless of its number of cases.
pub fn summarize(observations: &[Observation], prices: &PriceTable) -> Vec<ModelSummary> {
    let mut by_take: BTreeMap<(&str, usize), Vec<&Observation>> = BTreeMap::new();
    for observation in observations {
        by_take
            .entry((observation.model.as_str(), observation.take))
            .or_default()
            .push(observation);
    }

    let mut accuracies: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for ((model, _), group) in &by_take {
        let correct = group.iter().filter(|o| o.is_correct).count();
        accuracies
            .entry(model)
            .or_default()
            .push(correct as f64 / group.len() as f64);
    }

    accuracies
        .into_iter()
        .map(|(model, accs)| {
            let rows: Vec<&Observation> =
                observations.iter().filter(|o| o.model == model).collect();
            let avg_tokens_in = average_tokens(rows.iter().map(|o| o.tokens_in));
            let avg_tokens_out = average_tokens(rows.iter().map(|o| o.tokens_out));
            let price = prices.get(model);

            let price_in = avg_tokens_in
                .zip(price)
                .map(|(avg, (per_million, _))| avg * per_million / 1e6);
            let price_out = avg_tokens_out
                .zip(price)
                .map(|(avg, (_, per_million))| avg * per_million / 1e6);

            ModelSummary {
                model: model.to_string(),
                num_observations: rows.len(),
                true_observations: rows.iter().filter(|o| o.is_correct).count(),
                takes: accs.len(),
                acc_mean: mean(&accs),
                acc_stdvar: sample_std(&accs),
                avg_tokens_in,
                avg_tokens_out,
                price_token_in: price.map(|(p, _)| p),
                price_token_out: price.map(|(_, p)| p),
                price_in,
                price_out,
                price_total: price_in.zip(price_out).map(|(a, b)| a + b),
            }
        })
        .collect()
}
